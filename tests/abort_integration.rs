//! Descriptor accounting under aborted transfers
//!
//! Kept in its own test binary so no other test opens descriptors in the
//! same process while they are counted.

use asyncweb::{Config, Server};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

/// Count descriptors once the server has stopped opening or closing them
fn settled_fds() -> usize {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut last = open_fds();
    let mut steady = 0;
    while steady < 10 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
        let now = open_fds();
        if now == last {
            steady += 1;
        } else {
            steady = 0;
            last = now;
        }
    }
    last
}

#[test]
fn test_aborted_transfers_release_descriptors() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir(root.path().join("static")).unwrap();
    fs::create_dir(root.path().join("dynamic")).unwrap();
    let body: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 241) as u8).collect();
    fs::write(root.path().join("static/big.dat"), &body).unwrap();
    fs::write(root.path().join("dynamic/big.dat"), &body).unwrap();

    let mut server = Server::bind(Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        document_root: root.path().to_path_buf(),
        chunk_size: 4096,
        ..Config::default()
    })
    .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let runner = thread::spawn(move || server.run());

    // Let the first request set up whatever the process keeps around
    let mut warm = TcpStream::connect(addr).unwrap();
    warm.write_all(b"GET /missing/x HTTP/1.0\r\n\r\n").unwrap();
    warm.read_to_end(&mut Vec::new()).unwrap();
    drop(warm);

    // The server closes its side of the warm-up connection on its own thread
    let baseline = settled_fds();

    for round in 0..40 {
        let path = if round % 2 == 0 { "/static/big" } else { "/dynamic/big" };
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.0\r\n\r\n", path).as_bytes())
            .unwrap();
        let mut partial = [0u8; 4096];
        stream.read_exact(&mut partial).unwrap();
        drop(stream);
    }

    // The server notices each abort on its own schedule
    let deadline = Instant::now() + Duration::from_secs(20);
    while open_fds() > baseline && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(settled_fds(), baseline);

    handle.shutdown().unwrap();
    runner.join().unwrap().unwrap();
}
