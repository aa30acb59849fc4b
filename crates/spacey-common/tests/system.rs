// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Installing the process-wide context. Kept in its own test binary because
//! install happens once per process.

use spacey_common::io::TextStream;
use spacey_common::runtime::system;
use spacey_common::{CommonError, Config, MemoryStream, System};

#[test]
fn test_install_once() {
    assert!(System::global().is_err());

    let mut config = Config::default();
    config.newline = "\r\n".to_string();
    config.block_size = 512;
    let installed = System::install(config, vec!["spacey".into()]).unwrap();
    assert_eq!(installed.args(), ["spacey"]);
    assert!(System::global().is_ok());

    // defaults everywhere now follow the installed configuration
    assert_eq!(system::config().block_size, 512);
    let mut text = TextStream::new(MemoryStream::new(), None).unwrap();
    text.write_line("x").unwrap();
    assert_eq!(text.content().unwrap(), "x\r\n");

    let again = System::install(Config::default(), Vec::new());
    assert!(matches!(again, Err(CommonError::State(_))));
}
