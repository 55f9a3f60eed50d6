// Copyright 2020 Netwarps Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use async_std::net::{TcpListener, TcpStream};
use async_std::task;
use futures::channel::oneshot;
use futures::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use yamux::{Config, Connection, ConnectionError, Control, Mode, State};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let connect = TcpStream::connect(addr);
    let accept = async { listener.accept().await.expect("accept").0 };
    let (outbound, inbound) = futures::join!(connect, accept);
    (outbound.expect("connect"), inbound)
}

fn spawn_connection(
    socket: TcpStream,
    cfg: Config,
    mode: Mode,
) -> (Control, task::JoinHandle<yamux::Result<()>>) {
    let mut conn = Connection::new(socket, cfg, mode);
    let ctrl = conn.control();
    let handle = task::spawn(async move { conn.next_stream().await });
    (ctrl, handle)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[async_std::test]
async fn echo_through_one_stream() {
    init_log();
    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let echoed = task::spawn(async move {
        let mut stream = server.accept_stream().await.expect("accept");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.expect("read request");
        stream.write_all(&buf).await.expect("write reply");
        stream.close().await.expect("close");
        buf
    });

    let mut stream = client.open_stream().await.expect("open");
    assert!(stream.id().is_client());
    stream.write_all(b"hello").await.expect("write request");
    stream.close().await.expect("close");

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.expect("read reply");
    assert_eq!(b"hello", &buf);

    let mut rest = [0u8; 1];
    assert_eq!(0, stream.read(&mut rest).await.expect("eof"));
    assert_eq!(State::Closed, stream.state());
    assert_eq!(b"hello", &echoed.await);

    client.close().await.expect("close connection");
}

#[async_std::test]
async fn half_close_preserves_inbound_data() {
    init_log();
    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let server_side = task::spawn(async move {
        let mut stream = server.accept_stream().await.expect("accept");
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.expect("read abc");
        assert_eq!(b"abc", &buf);
        let mut rest = [0u8; 1];
        assert_eq!(0, stream.read(&mut rest).await.expect("eof after abc"));
        stream.write_all(b"xyz").await.expect("write after remote close");
        stream.close().await.expect("close");
        let mut rest = [0u8; 1];
        assert_eq!(0, stream.read(&mut rest).await.expect("eof"));
        assert_eq!(State::Closed, stream.state());
    });

    let mut stream = client.open_stream().await.expect("open");
    stream.write_all(b"abc").await.expect("write abc");
    stream.close().await.expect("half-close");

    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).await.expect("read xyz");
    assert_eq!(b"xyz", &buf);
    let mut rest = [0u8; 1];
    assert_eq!(0, stream.read(&mut rest).await.expect("eof"));
    assert_eq!(State::Closed, stream.state());

    server_side.await;
    client.close().await.expect("close connection");
}

#[async_std::test]
async fn backpressure_suspends_and_resumes_the_writer() {
    init_log();
    // More than one full receive window, so the transfer can only complete
    // if window updates flow back as the reader consumes.
    const TOTAL: usize = 400 * 1024;

    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let reading = Arc::new(AtomicBool::new(false));
    let reading2 = reading.clone();

    let received = task::spawn(async move {
        let mut stream = server.accept_stream().await.expect("accept");
        task::sleep(Duration::from_millis(100)).await;
        reading2.store(true, Ordering::SeqCst);
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.expect("read to end");
        data
    });

    let mut stream = client.open_stream().await.expect("open");
    stream.write_all(&pattern(TOTAL)).await.expect("write");
    // The write is larger than the initial window; it can only have
    // completed after the reader released credit.
    assert!(reading.load(Ordering::SeqCst));
    stream.close().await.expect("close");

    let data = received.await;
    assert_eq!(TOTAL, data.len());
    assert_eq!(pattern(TOTAL), data);

    client.close().await.expect("close connection");
}

#[async_std::test]
async fn stream_reset_propagates() {
    init_log();
    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let (accepted_tx, accepted_rx) = oneshot::channel();
    let server_side = task::spawn(async move {
        let mut stream = server.accept_stream().await.expect("accept");
        accepted_tx.send(()).expect("signal accepted");
        // Give the reset time to arrive before looking at the stream.
        task::sleep(Duration::from_millis(100)).await;
        let mut buf = [0u8; 100];
        let err = stream.read(&mut buf).await.expect_err("read after reset");
        assert_eq!(std::io::ErrorKind::ConnectionReset, err.kind());
        assert_eq!(State::Reset, stream.state());
        server
    });

    let mut stream = client.open_stream().await.expect("open");
    stream.write_all(&[0x42; 100]).await.expect("write");
    accepted_rx.await.expect("accepted");
    stream.reset().await;
    assert_eq!(State::Reset, stream.state());

    let mut server = server_side.await;

    // Only the stream died; the session is still usable in both directions.
    let accept = task::spawn(async move { server.accept_stream().await.expect("accept second") });
    let second = client.open_stream().await.expect("open second");
    assert!(second.id().val() > stream.id().val());
    accept.await;

    client.close().await.expect("close connection");
}

#[async_std::test]
async fn keepalive_loss_terminates_the_session() {
    init_log();
    let (a, b) = tcp_pair().await;

    // A peer that swallows everything and never answers a ping.
    let _silent = task::spawn(async move {
        let mut b = b;
        let mut buf = [0u8; 4096];
        while let Ok(n) = b.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    let mut cfg = Config::default();
    cfg.set_keepalive_interval(Duration::from_millis(50))
        .set_ping_timeout(Duration::from_millis(100))
        .set_ping_timeout_threshold(3);

    let start = Instant::now();
    let (mut ctrl, driver) = spawn_connection(a, cfg, Mode::Client);
    let result = driver.await;
    assert!(
        matches!(result, Err(ConnectionError::KeepAliveTimeout)),
        "unexpected result: {:?}",
        result
    );
    assert!(start.elapsed() < Duration::from_secs(2));

    match ctrl.open_stream().await {
        Err(ConnectionError::Closed) => {}
        other => panic!("open after shutdown: {:?}", other),
    }
}

#[async_std::test]
async fn protocol_violation_triggers_go_away() {
    init_log();
    let (mut raw, b) = tcp_pair().await;
    let (_ctrl, driver) = spawn_connection(b, Config::default(), Mode::Server);

    // A frame with version byte 1.
    let mut bad = [0u8; 12];
    bad[0] = 1;
    raw.write_all(&bad).await.expect("write bad frame");

    // The session answers with go away (protocol error) and closes down.
    let mut reply = [0u8; 12];
    raw.read_exact(&mut reply).await.expect("read go away");
    assert_eq!(0, reply[0], "version");
    assert_eq!(3, reply[1], "type is go away");
    assert_eq!(0, u32::from_be_bytes([reply[4], reply[5], reply[6], reply[7]]), "session id");
    assert_eq!(1, u32::from_be_bytes([reply[8], reply[9], reply[10], reply[11]]), "protocol error code");

    let mut rest = [0u8; 1];
    assert_eq!(0, raw.read(&mut rest).await.expect("transport closed"), "eof");

    let result = driver.await;
    assert!(
        matches!(result, Err(ConnectionError::Decode(_))),
        "unexpected result: {:?}",
        result
    );
}

#[async_std::test]
async fn lazy_open_carries_syn_on_the_first_data_frame() {
    init_log();
    let (mut raw, b) = tcp_pair().await;
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    // A peer that opens lazily: no window update first, the SYN rides on
    // its first data frame.
    let mut frame = [0u8; 14];
    frame[1] = 0; // data
    frame[2..4].copy_from_slice(&1u16.to_be_bytes()); // SYN
    frame[4..8].copy_from_slice(&1u32.to_be_bytes()); // stream id 1
    frame[8..12].copy_from_slice(&2u32.to_be_bytes()); // body length
    frame[12..14].copy_from_slice(b"hi");
    raw.write_all(&frame).await.expect("write lazy syn");

    let mut stream = server.accept_stream().await.expect("accept");
    assert_eq!(1, stream.id().val());
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.expect("read body");
    assert_eq!(b"hi", &buf);

    // The stream is acknowledged with ACK alone on a window update.
    let mut reply = [0u8; 12];
    raw.read_exact(&mut reply).await.expect("read ack");
    assert_eq!(0, reply[0], "version");
    assert_eq!(1, reply[1], "type is window update");
    assert_eq!(2, u16::from_be_bytes([reply[2], reply[3]]), "ack alone");
    assert_eq!(1, u32::from_be_bytes([reply[4], reply[5], reply[6], reply[7]]), "stream id");
    assert_eq!(0, u32::from_be_bytes([reply[8], reply[9], reply[10], reply[11]]), "no extra credit");
}

#[async_std::test]
async fn concurrent_streams() {
    init_log();
    const NSTREAMS: usize = 20;
    const SIZE: usize = 64 * 1024;

    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let server_side = task::spawn(async move {
        let mut workers = Vec::new();
        for _ in 0..NSTREAMS {
            let mut stream = server.accept_stream().await.expect("accept");
            workers.push(task::spawn(async move {
                let mut buf = vec![0u8; 8 * 1024];
                loop {
                    let n = stream.read(&mut buf).await.expect("read");
                    if n == 0 {
                        break;
                    }
                    stream.write_all(&buf[..n]).await.expect("write back")
                }
                stream.close().await.expect("close")
            }))
        }
        for w in workers {
            w.await
        }
    });

    let data = Arc::new(pattern(SIZE));
    let mut clients = Vec::new();
    for _ in 0..NSTREAMS {
        let mut stream = client.open_stream().await.expect("open");
        let data = data.clone();
        clients.push(task::spawn(async move {
            stream.write_all(&data).await.expect("write");
            stream.close().await.expect("close");
            let mut echoed = vec![0u8; SIZE];
            stream.read_exact(&mut echoed).await.expect("read echo");
            assert_eq!(&data[..], &echoed[..]);
            let mut rest = [0u8; 1];
            assert_eq!(0, stream.read(&mut rest).await.expect("eof"))
        }))
    }
    for c in clients {
        c.await
    }
    server_side.await;

    client.close().await.expect("close connection");
}

#[async_std::test]
async fn open_stream_times_out_without_ack() {
    init_log();
    let (a, b) = tcp_pair().await;

    // A peer that accepts the connection but never speaks yamux.
    let _silent = task::spawn(async move {
        let mut b = b;
        let mut buf = [0u8; 4096];
        while let Ok(n) = b.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    let mut cfg = Config::default();
    cfg.set_stream_open_timeout(Duration::from_millis(100));
    let (mut ctrl, _driver) = spawn_connection(a, cfg, Mode::Client);

    let start = Instant::now();
    match ctrl.open_stream().await {
        Err(ConnectionError::StreamOpenTimeout) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[async_std::test]
async fn deadline_fails_pending_read_but_keeps_the_stream() {
    init_log();
    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let (timed_out_tx, timed_out_rx) = oneshot::channel();
    let server_side = task::spawn(async move {
        let mut stream = server.accept_stream().await.expect("accept");
        timed_out_rx.await.expect("signal");
        stream.write_all(b"late").await.expect("write late");
        stream.close().await.expect("close")
    });

    let mut stream = client.open_stream().await.expect("open");
    stream.set_deadline(Some(Instant::now() + Duration::from_millis(50)));
    let mut buf = [0u8; 4];
    let err = stream.read(&mut buf).await.expect_err("deadline");
    assert_eq!(std::io::ErrorKind::TimedOut, err.kind());

    // The stream survives an expired deadline.
    stream.set_deadline(None);
    timed_out_tx.send(()).expect("signal");
    stream.read_exact(&mut buf).await.expect("read late data");
    assert_eq!(b"late", &buf);

    server_side.await;
    client.close().await.expect("close connection");
}

#[async_std::test]
async fn close_read_gives_eof_without_touching_the_peer() {
    init_log();
    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let server_side = task::spawn(async move {
        let mut stream = server.accept_stream().await.expect("accept");
        stream.write_all(b"ignored").await.expect("write");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("read");
        buf
    });

    let mut stream = client.open_stream().await.expect("open");
    stream.close_read();
    let mut buf = [0u8; 16];
    assert_eq!(0, stream.read(&mut buf).await.expect("eof"));
    // The writing direction is unaffected.
    stream.write_all(b"pong").await.expect("write");
    assert_eq!(b"pong", &server_side.await);

    client.close().await.expect("close connection");
}

#[async_std::test]
async fn close_is_idempotent_and_fails_later_opens() {
    init_log();
    let (a, b) = tcp_pair().await;
    let (mut client, client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    client.close().await.expect("close");
    client.close().await.expect("close again");

    assert!(matches!(client_driver.await, Ok(())));
    // The remote observes the normal termination.
    assert!(matches!(server_driver.await, Err(ConnectionError::Closed)));

    match client.open_stream().await {
        Err(ConnectionError::Closed) => {}
        other => panic!("open after close: {:?}", other),
    }
    match server.accept_stream().await {
        Err(ConnectionError::Closed) => {}
        other => panic!("accept after close: {:?}", other),
    }
}

#[async_std::test]
async fn stream_ids_follow_role_parity() {
    init_log();
    let (a, b) = tcp_pair().await;
    let (mut client, _client_driver) = spawn_connection(a, Config::default(), Mode::Client);
    let (mut server, _server_driver) = spawn_connection(b, Config::default(), Mode::Server);

    let server_side = task::spawn(async move {
        let inbound = server.accept_stream().await.expect("accept");
        assert!(inbound.id().is_client());
        let outbound = server.open_stream().await.expect("open from server");
        assert!(outbound.id().is_server());
        assert_eq!(2, outbound.id().val());
        server
    });

    let first = client.open_stream().await.expect("open");
    assert_eq!(1, first.id().val());
    let from_server = client.accept_stream().await.expect("accept from server");
    assert!(from_server.id().is_server());
    let third = client.open_stream().await.expect("open another");
    assert_eq!(3, third.id().val());

    server_side.await;
    client.close().await.expect("close connection");
}
