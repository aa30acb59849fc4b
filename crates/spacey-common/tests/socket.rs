// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Socket module tests over loopback

use spacey_common::binary::{Binary, ByteString};
use spacey_common::modules::socket::{Family, Shutdown, Socket};
use spacey_common::runtime::fiber::{self, FiberState, run};
use spacey_common::{CommonError, Result};
use std::time::Duration;

async fn listener() -> Result<(Socket, u16)> {
    let mut server = Socket::new(Family::Inet)?;
    server.bind("127.0.0.1", 0).await?;
    server.listen(16)?;
    let port = server.local_addr()?.port();
    Ok((server, port))
}

#[tokio::test]
async fn test_echo_round_trip() {
    let received = run(async {
        let (server, port) = listener().await?;
        let echo = fiber::spawn(async move {
            let mut connection = server.accept().await?;
            let stream = connection.get_stream()?;
            let mut output = stream.clone();
            stream.copy(&mut output).await?;
            connection.close().await
        });

        let mut client = Socket::new(Family::Inet)?;
        client.connect("localhost", port, Some(Duration::from_secs(5))).await?;
        assert_eq!(client.peer_addr()?.port(), port);

        client.send(&ByteString::from("hello ")).await?;
        assert_eq!(client.read(6).await?, "hello ");
        client.write(&ByteString::from("world"))?;
        client.shutdown(Shutdown::Write).await?;

        let rest = client.get_stream()?.read_all().await?;
        assert_eq!(echo.join().await, FiberState::Completed);
        client.close().await?;
        Ok(rest)
    })
    .await
    .unwrap();

    assert_eq!(received, "world");
}

#[tokio::test]
async fn test_get_stream_is_shared() {
    run(async {
        let (server, port) = listener().await?;
        let accepted = fiber::spawn(async move {
            let connection = server.accept().await?;
            connection.send(&ByteString::from("abcdef")).await?;
            // keep the connection open until the peer hangs up
            connection.get_stream()?.read_all().await?;
            Ok(())
        });

        let mut client = Socket::new(Family::Inet)?;
        client.connect("127.0.0.1", port, None).await?;
        let first = client.get_stream()?;
        let second = client.get_stream()?;
        assert_eq!(first.read(3).await?, "abc");
        assert_eq!(second.read(3).await?, "def");

        client.close().await?;
        assert!(matches!(client.get_stream(), Err(CommonError::Closed)));
        accepted.join().await;
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_receive_returns_available_bytes() {
    run(async {
        let (server, port) = listener().await?;
        let sender = fiber::spawn(async move {
            let mut connection = server.accept().await?;
            connection.send(&ByteString::from("partial")).await?;
            connection.close().await
        });

        let mut client = Socket::new(Family::Inet)?;
        client.connect("127.0.0.1", port, None).await?;
        let chunk = client.receive(1024).await?;
        assert!(!chunk.is_empty());
        assert!("partial".as_bytes().starts_with(chunk.as_slice()));
        sender.join().await;
        client.close().await
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_connect_times_out_when_backlog_is_full() {
    let timed_out = run(async {
        let mut server = Socket::new(Family::Inet)?;
        server.bind("127.0.0.1", 0).await?;
        server.listen(1)?;
        let port = server.local_addr()?.port();

        // Nobody accepts, so the queue fills and later handshakes stall
        let mut held = Vec::new();
        for _ in 0..64 {
            let mut client = Socket::new(Family::Inet)?;
            match client
                .connect("127.0.0.1", port, Some(Duration::from_millis(200)))
                .await
            {
                Ok(()) => held.push(client),
                Err(CommonError::Timeout) => return Ok(true),
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    })
    .await
    .unwrap();

    assert!(timed_out);
}
