// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Network scenarios driven by plain blocking clients on OS threads.

use kcoro::net::{self, RecvFlags, SendFlags};
use kcoro::sync::WaitGroup;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn listen_on_ephemeral_port() -> (net::Socket, u16) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = net::socket(&addr).unwrap();
    net::bind(listener, &addr).unwrap();
    net::listen(listener, 5).unwrap();
    let port = net::local_addr(listener).unwrap().port();
    (listener, port)
}

/// An echo server: accept, then per connection loop recv → send until the
/// peer closes. The client must read back exactly what it wrote and observe
/// an orderly close after the server's side goes down.
#[test]
fn echo_round_trip() {
    let (port_tx, port_rx) = mpsc::channel::<u16>();

    let client = thread::spawn(move || {
        let port = port_rx.recv().unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

        stream.write_all(b"hello\n").unwrap();

        let mut buf = [0_u8; 16];
        let mut read = 0;
        while read < 6 {
            let n = stream.read(&mut buf[read..]).unwrap();
            assert!(n > 0, "server closed before echoing everything");
            read += n;
        }
        assert_eq!(&buf[..6], b"hello\n");

        // closing our side ends the server's recv loop with 0
        drop(stream);
    });

    kcoro::start_main(async move {
        let (listener, port) = listen_on_ephemeral_port();
        port_tx.send(port).unwrap();

        let (client_sock, _peer) = net::accept(listener).await.unwrap();

        let served = Arc::new(WaitGroup::new(1));
        {
            let served = served.clone();
            kcoro::spawn(async move {
                let mut buf = [0_u8; 1024];
                'serve: loop {
                    let n = match net::recv(client_sock, &mut buf[..1023], RecvFlags::empty()).await
                    {
                        Ok(n) if n > 0 => n,
                        // 0 is the orderly close; errors end the connection too
                        _ => break,
                    };

                    let mut sent = 0;
                    while sent < n {
                        match net::send(client_sock, &buf[sent..n], SendFlags::empty()).await {
                            Ok(m) if m > 0 => sent += m,
                            _ => break 'serve,
                        }
                    }
                }
                net::close_socket(client_sock);
                served.done();
            });
        }

        served.wait().await;
        net::close_socket(listener);
    });

    client.join().unwrap();
}

/// `WAITALL` keeps the operation armed until the requested length has
/// accumulated, across multiple partial arrivals.
#[test]
fn recv_wait_all_accumulates() {
    const MESSAGE: &[u8] = b"0123456789";

    let (port_tx, port_rx) = mpsc::channel::<u16>();

    let client = thread::spawn(move || {
        let port = port_rx.recv().unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

        // two separated chunks; the server must see one 10-byte completion
        stream.write_all(&MESSAGE[..4]).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        stream.write_all(&MESSAGE[4..]).unwrap();

        let mut buf = [0_u8; 10];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, MESSAGE);
    });

    kcoro::start_main(async move {
        let (listener, port) = listen_on_ephemeral_port();
        port_tx.send(port).unwrap();

        let (client_sock, _peer) = net::accept(listener).await.unwrap();

        let mut buf = [0_u8; 10];
        let n = net::recv(client_sock, &mut buf, RecvFlags::WAITALL).await.unwrap();
        assert_eq!(n, MESSAGE.len());
        assert_eq!(&buf, MESSAGE);

        let sent = net::send(client_sock, &buf, SendFlags::empty()).await.unwrap();
        assert_eq!(sent, MESSAGE.len());

        net::close_socket(client_sock);
        net::close_socket(listener);
    });

    client.join().unwrap();
}

/// `start_main` must return within bounded time after the main task's last
/// statement, even though the reactor thread was blocking in its wait.
#[test]
fn reactor_teardown_is_bounded() {
    let (port_tx, port_rx) = mpsc::channel::<u16>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let server = thread::spawn(move || {
        kcoro::start_main(async move {
            let (listener, port) = listen_on_ephemeral_port();
            port_tx.send(port).unwrap();

            let (client_sock, _peer) = net::accept(listener).await.unwrap();
            net::close_socket(client_sock);
            net::close_socket(listener);
        });
        done_tx.send(()).unwrap();
    });

    let port = port_rx.recv().unwrap();
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("start_main did not return after the main task completed");

    drop(stream);
    server.join().unwrap();
}

/// The synchronous connect shim completes against a live listener.
#[test]
fn connect_is_synchronous() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let accepter = thread::spawn(move || {
        let (_stream, _peer) = listener.accept().unwrap();
    });

    kcoro::start_main(async move {
        let sock = net::socket(&addr).unwrap();
        net::connect(sock, &addr).await.unwrap();
        net::close_socket(sock);
    });

    accepter.join().unwrap();
}
