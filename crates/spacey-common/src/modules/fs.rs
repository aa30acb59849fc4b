// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Filesystem module
//!
//! [`open`] hands out streams over files. The remaining functions are
//! one-shot helpers built on top of it or on `tokio::fs`.

use crate::binary::{Binary, ByteString};
use crate::error::{CommonError, Result};
use crate::io::{AnyStream, Stream, TextOptions, TextStream};
use crate::runtime::system;
use nix::unistd::{self, AccessFlags, Gid, Group, Uid, User};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// How to open a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Open for reading. Implied when no other access flag is set.
    pub read: bool,
    /// Open for writing, truncating
    pub write: bool,
    /// Open for writing at the end
    pub append: bool,
    /// Read and write in place (not supported)
    pub update: bool,
    /// Return a raw stream instead of a text stream
    pub binary: bool,
    /// Fail if the file already exists
    pub exclusive: bool,
    /// Resolve symbolic links before opening
    pub canonical: bool,
    /// Charset for text mode
    pub charset: Option<String>,
    /// Permission bits for a created file
    pub permissions: Option<u32>,
}

impl OpenOptions {
    /// Options for reading
    pub fn read() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Options for writing
    pub fn write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    /// Switch to binary mode
    pub fn binary(mut self) -> Self {
        self.binary = true;
        self
    }

    /// Parse a mode string such as `"rb"` or `"a"`.
    ///
    /// `r` read, `w` write, `a` append, `+` update, `b` binary, `x`
    /// exclusive, `c` canonical.
    pub fn from_mode(mode: &str) -> Result<Self> {
        let mut options = Self::default();
        for flag in mode.chars() {
            match flag {
                'r' => options.read = true,
                'w' => options.write = true,
                'a' => options.append = true,
                '+' => options.update = true,
                'b' => options.binary = true,
                'x' => options.exclusive = true,
                'c' => options.canonical = true,
                _ => {
                    return Err(CommonError::argument(format!(
                        "unsupported mode argument: {}",
                        mode
                    )));
                }
            }
        }
        Ok(options)
    }

    /// Build options from key/value pairs. Unknown keys are rejected.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "read" => options.read = parse_flag(key, value)?,
                "write" => options.write = parse_flag(key, value)?,
                "append" => options.append = parse_flag(key, value)?,
                "update" => options.update = parse_flag(key, value)?,
                "binary" => options.binary = parse_flag(key, value)?,
                "exclusive" => options.exclusive = parse_flag(key, value)?,
                "canonical" => options.canonical = parse_flag(key, value)?,
                "charset" => options.charset = Some(value.to_string()),
                "permissions" => {
                    let mode = u32::from_str_radix(value.trim_start_matches("0o"), 8)
                        .map_err(|_| {
                            CommonError::argument(format!("permissions must be octal: {}", value))
                        })?;
                    options.permissions = Some(mode);
                }
                _ => return Err(CommonError::argument(format!("unsupported option: {}", key))),
            }
        }
        Ok(options)
    }

    fn is_reading(&self) -> bool {
        self.read || !(self.write || self.append || self.update)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(CommonError::argument(format!(
            "option {} must be a boolean: {}",
            key, value
        ))),
    }
}

/// Open `path`, returning a raw stream in binary mode and a text stream
/// otherwise.
///
/// Reading wins when it is combined with write or append.
pub async fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<AnyStream> {
    let raw = open_raw(path, options).await?;
    if options.binary {
        return Ok(AnyStream::Raw(raw));
    }
    let text_options = options.charset.clone().map(TextOptions::charset);
    Ok(AnyStream::Text(TextStream::new(raw, text_options)?))
}

/// Open `path` as a raw stream, ignoring the binary and charset options
pub async fn open_raw(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Stream> {
    if options.update {
        return Err(CommonError::unsupported("update mode"));
    }
    let mut file = absolute(path)?;
    if options.canonical {
        file = tokio::fs::canonicalize(&file).await?;
    }

    let mut platform = tokio::fs::OpenOptions::new();
    if options.is_reading() {
        tracing::debug!(path = %file.display(), "opening file for reading");
        let handle = platform.read(true).open(&file).await?;
        return Ok(Stream::from_reader(handle));
    }

    let permissions = options
        .permissions
        .unwrap_or_else(|| system::config().file_permissions);
    platform.write(true).mode(permissions);
    if options.append {
        platform.append(true);
    } else {
        platform.truncate(true);
    }
    if options.exclusive {
        platform.create_new(true);
    } else {
        platform.create(true);
    }

    tracing::debug!(path = %file.display(), append = options.append, "opening file for writing");
    let handle = platform.open(&file).await?;
    Ok(Stream::from_writer(handle))
}

/// Read a whole file as text
pub async fn read_text(path: impl AsRef<Path>, charset: Option<&str>) -> Result<String> {
    let options = OpenOptions {
        charset: charset.map(str::to_string),
        ..OpenOptions::read()
    };
    let mut text = match open(path, &options).await?.into_text() {
        Some(text) => text,
        None => return Err(CommonError::state("expected a text stream")),
    };
    let result = text.read().await;
    finish(result, text.close().await)
}

/// Read a whole file as bytes
pub async fn read_bytes(path: impl AsRef<Path>) -> Result<ByteString> {
    let stream = open_raw(path, &OpenOptions::read()).await?;
    let result = stream.read_all().await;
    finish(result, stream.close().await)
}

/// Replace the content of a file with `text`
pub async fn write_text(path: impl AsRef<Path>, text: &str, charset: Option<&str>) -> Result<()> {
    let options = OpenOptions {
        charset: charset.map(str::to_string),
        ..OpenOptions::write()
    };
    let mut stream = match open(path, &options).await?.into_text() {
        Some(stream) => stream,
        None => return Err(CommonError::state("expected a text stream")),
    };
    let result = match stream.write(text) {
        Ok(()) => stream.flush().await,
        Err(err) => Err(err),
    };
    finish(result, stream.close().await)
}

/// Replace the content of a file with `data`
pub async fn write_bytes(path: impl AsRef<Path>, data: &dyn Binary) -> Result<()> {
    let stream = open_raw(path, &OpenOptions::write()).await?;
    let result = match stream.write(data) {
        Ok(()) => stream.flush().await,
        Err(err) => Err(err),
    };
    finish(result, stream.close().await)
}

/// Copy a file in binary mode
pub async fn copy(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let input = open_raw(from, &OpenOptions::read()).await?;
    let mut output = open_raw(to, &OpenOptions::write()).await?;
    let result = input.copy(&mut output).await;
    let closed = input.close().await.and(output.close().await);
    finish(result, closed)
}

/// The first error wins, but the close still happens
fn finish<T>(result: Result<T>, closed: Result<()>) -> Result<T> {
    let value = result?;
    closed?;
    Ok(value)
}

/// Whether anything exists at `path`
pub async fn exists(path: impl AsRef<Path>) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Whether `path` is a regular file, following links
pub async fn is_file(path: impl AsRef<Path>) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Whether `path` is a directory, following links
pub async fn is_directory(path: impl AsRef<Path>) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_dir())
}

/// Size of a regular file in bytes
pub async fn size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(not_a_file(path));
    }
    Ok(meta.len())
}

/// Names of the entries in a directory, sorted
pub async fn list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(path).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Remove a file. Directories are rejected.
pub async fn remove(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if tokio::fs::symlink_metadata(path).await?.is_dir() {
        return Err(not_a_file(path));
    }
    tokio::fs::remove_file(path).await?;
    Ok(())
}

/// Remove an empty directory
pub async fn remove_directory(path: impl AsRef<Path>) -> Result<()> {
    tokio::fs::remove_dir(path).await?;
    Ok(())
}

/// Create one directory. The parent must exist.
pub async fn make_directory(path: impl AsRef<Path>, permissions: Option<u32>) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    if let Some(mode) = permissions {
        builder.mode(mode);
    }
    builder.create(path).await?;
    Ok(())
}

/// `path` made absolute against the working directory, without touching the
/// filesystem
pub fn absolute(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(CommonError::argument("empty path"));
    }
    Ok(std::path::absolute(path)?)
}

/// Set the modification time of a file (not supported)
pub async fn touch(_path: impl AsRef<Path>) -> Result<()> {
    Err(CommonError::unsupported("touch"))
}

/// Move or rename a file or directory
pub async fn rename(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
    tokio::fs::rename(source, target).await?;
    Ok(())
}

/// Create a directory and any missing parents. An existing directory is fine.
pub async fn make_tree(path: impl AsRef<Path>) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

/// Remove `path`, descending into directories. Links are removed, never
/// followed.
pub async fn remove_tree(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let meta = tokio::fs::symlink_metadata(path).await?;
    tracing::debug!(path = %path.display(), "removing tree");
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

/// Every path below `path`, relative to it, depth first with entries sorted
/// within each directory. The first entry is the empty path for `path`
/// itself. Links to directories are listed but not descended into.
pub async fn list_tree(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    walk(path.as_ref(), false).await
}

/// Like [`list_tree`], but only directories
pub async fn list_directory_tree(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    walk(path.as_ref(), true).await
}

async fn walk(root: &Path, directories_only: bool) -> Result<Vec<PathBuf>> {
    let root = if root.as_os_str().is_empty() { Path::new(".") } else { root };
    let mut found = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let full = below(root, &relative);
        let meta = tokio::fs::symlink_metadata(&full).await?;
        let is_link = meta.file_type().is_symlink();
        let descend = !is_link && meta.is_dir();

        if directories_only && !descend && !(is_link && is_directory(&full).await) {
            continue;
        }
        found.push(relative.clone());

        if descend {
            let mut children = list(&full).await?;
            // Reversed so the smallest name comes off the stack first
            children.reverse();
            pending.extend(children.into_iter().map(|child| relative.join(child)));
        }
    }
    Ok(found)
}

// Joining an empty path would add a trailing separator, which fails for files
fn below(root: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Copy `from` to `to`, recreating directories and links below it.
///
/// The target may neither be the source nor lie inside it.
pub async fn copy_tree(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let source = tokio::fs::canonicalize(from).await?;
    let target = absolute(to)?;
    if target == source {
        return Err(CommonError::argument("source and target of copy_tree are the same"));
    }
    if target.starts_with(&source) {
        return Err(CommonError::argument("target of copy_tree is inside the source"));
    }

    for relative in list_tree(&source).await? {
        let from = below(&source, &relative);
        let to = below(&target, &relative);
        let meta = tokio::fs::symlink_metadata(&from).await?;
        if meta.file_type().is_symlink() {
            symbolic_link(read_link(&from).await?, &to).await?;
        } else if meta.is_dir() {
            make_tree(&to).await?;
        } else {
            copy(&from, &to).await?;
        }
    }
    Ok(())
}

/// When the file was last modified
pub async fn last_modified(path: impl AsRef<Path>) -> Result<SystemTime> {
    Ok(tokio::fs::metadata(path).await?.modified()?)
}

/// Whether `path` itself is a symbolic link
pub async fn is_link(path: impl AsRef<Path>) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .is_ok_and(|meta| meta.file_type().is_symlink())
}

/// Whether `path` exists and this process may read it
pub fn is_readable(path: impl AsRef<Path>) -> bool {
    unistd::access(path.as_ref(), AccessFlags::R_OK).is_ok()
}

/// Whether `path` exists and this process may write it
pub fn is_writable(path: impl AsRef<Path>) -> bool {
    unistd::access(path.as_ref(), AccessFlags::W_OK).is_ok()
}

/// Create a symbolic link at `target` pointing to `source`
pub async fn symbolic_link(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
    tokio::fs::symlink(source, target).await?;
    Ok(())
}

/// Create a hard link at `target` to the file at `source`
pub async fn hard_link(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
    tokio::fs::hard_link(source, target).await?;
    Ok(())
}

/// The immediate target of a symbolic link
pub async fn read_link(path: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(tokio::fs::read_link(path).await?)
}

/// `path` made absolute with every link resolved. The path must exist.
pub async fn canonical(path: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(tokio::fs::canonicalize(path).await?)
}

/// Whether two paths name the same file, through links of either kind
pub async fn same(a: impl AsRef<Path>, b: impl AsRef<Path>) -> Result<bool> {
    let a = tokio::fs::metadata(a).await?;
    let b = tokio::fs::metadata(b).await?;
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

/// Whether two paths live on the same filesystem
pub async fn same_filesystem(a: impl AsRef<Path>, b: impl AsRef<Path>) -> Result<bool> {
    let a = tokio::fs::metadata(a).await?;
    let b = tokio::fs::metadata(b).await?;
    Ok(a.dev() == b.dev())
}

/// The process working directory
pub fn working_directory() -> Result<PathBuf> {
    Ok(std::env::current_dir()?)
}

/// Change the process working directory
pub fn change_working_directory(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    std::env::set_current_dir(path)?;
    tracing::debug!(path = %path.display(), "changed working directory");
    Ok(())
}

/// Permission bits of a file, without the file type
pub async fn permissions(path: impl AsRef<Path>) -> Result<u32> {
    Ok(tokio::fs::metadata(path).await?.mode() & 0o777)
}

/// Replace the permission bits of a file. Set-id and sticky bits are kept.
pub async fn change_permissions(path: impl AsRef<Path>, mode: u32) -> Result<()> {
    let path = path.as_ref();
    if mode & !0o777 != 0 {
        return Err(CommonError::argument(format!("invalid permissions: {:o}", mode)));
    }
    let preserved = tokio::fs::metadata(path).await?.mode() & 0o7000;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(preserved | mode)).await?;
    Ok(())
}

/// Name of the user owning a file, or the numeric id when it has no name
pub async fn owner(path: impl AsRef<Path>) -> Result<String> {
    let uid = tokio::fs::metadata(path).await?.uid();
    Ok(match User::from_uid(Uid::from_raw(uid))? {
        Some(user) => user.name,
        None => uid.to_string(),
    })
}

/// Name of the group owning a file, or the numeric id when it has no name
pub async fn group(path: impl AsRef<Path>) -> Result<String> {
    let gid = tokio::fs::metadata(path).await?.gid();
    Ok(match Group::from_gid(Gid::from_raw(gid))? {
        Some(group) => group.name,
        None => gid.to_string(),
    })
}

/// Hand a file to another user, given by name or numeric id
pub fn change_owner(path: impl AsRef<Path>, user: &str) -> Result<()> {
    let uid = match user.parse::<u32>() {
        Ok(id) => Uid::from_raw(id),
        Err(_) => User::from_name(user)?
            .map(|user| user.uid)
            .ok_or_else(|| CommonError::argument(format!("unknown user: {}", user)))?,
    };
    unistd::chown(path.as_ref(), Some(uid), None)?;
    Ok(())
}

/// Hand a file to another group, given by name or numeric id
pub fn change_group(path: impl AsRef<Path>, group: &str) -> Result<()> {
    let gid = match group.parse::<u32>() {
        Ok(id) => Gid::from_raw(id),
        Err(_) => Group::from_name(group)?
            .map(|group| group.gid)
            .ok_or_else(|| CommonError::argument(format!("unknown group: {}", group)))?,
    };
    unistd::chown(path.as_ref(), None, Some(gid))?;
    Ok(())
}

fn not_a_file(path: &Path) -> CommonError {
    CommonError::io(
        io::ErrorKind::InvalidInput,
        format!("{} is not a file", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_strings() {
        let options = OpenOptions::from_mode("rb").unwrap();
        assert!(options.read && options.binary);
        assert!(!options.write);

        let options = OpenOptions::from_mode("ax").unwrap();
        assert!(options.append && options.exclusive);
        assert!(!options.is_reading());

        assert!(OpenOptions::default().is_reading());
        assert!(matches!(
            OpenOptions::from_mode("rq"),
            Err(CommonError::Argument(_))
        ));
    }

    #[test]
    fn test_option_pairs() {
        let options = OpenOptions::from_pairs([
            ("write", "true"),
            ("charset", "latin1"),
            ("permissions", "600"),
        ])
        .unwrap();
        assert!(options.write);
        assert_eq!(options.charset.as_deref(), Some("latin1"));
        assert_eq!(options.permissions, Some(0o600));

        let err = OpenOptions::from_pairs([("colour", "red")]).unwrap_err();
        assert_eq!(err.to_string(), "Illegal argument: unsupported option: colour");
        assert!(OpenOptions::from_pairs([("read", "maybe")]).is_err());
    }

    #[tokio::test]
    async fn test_update_and_touch_are_unsupported() {
        let options = OpenOptions::from_mode("r+").unwrap();
        assert!(matches!(
            open("anything", &options).await,
            Err(CommonError::Unsupported(_))
        ));
        assert!(matches!(touch("anything").await, Err(CommonError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = open(&missing, &OpenOptions::default()).await.unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert!(!exists(&missing).await);
        assert!(size(dir.path()).await.is_err());
    }

    #[test]
    fn test_absolute() {
        let path = absolute("some/file").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("some/file"));
        assert!(absolute("").is_err());
    }
}
