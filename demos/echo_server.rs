//! TCP echo server on the fiber runtime.
//!
//! Usage: `echo_server [addr]` (default 0.0.0.0:8020). Each connection gets
//! its own fiber; all of them share the scheduler's worker threads.

use std::net::SocketAddr;

use log::{error, info};

use fibrio::ioman::IoManager;
use fibrio::scheduler::Task;
use fibrio::socket::Socket;

fn serve(client: Socket, peer: SocketAddr) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match client.recv(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!("recv from {}: {}", peer, e);
                break;
            }
        };
        let mut sent = 0;
        while sent < n {
            match client.send(&buf[sent..n]) {
                Ok(m) => sent += m,
                Err(e) => {
                    error!("send to {}: {}", peer, e);
                    return;
                }
            }
        }
    }
    info!("{} disconnected", peer);
}

fn main() {
    fibrio::log::init().expect("logger");

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:8020".to_string())
        .parse()
        .expect("listen address");

    let iom = IoManager::new(2, true, "echo").expect("io scheduler");
    iom.schedule(Task::call(move || {
        let listener = Socket::tcp().expect("socket");
        listener.bind(&addr).expect("bind");
        listener.listen(1024).expect("listen");
        info!("echoing on {}", addr);

        loop {
            match listener.accept() {
                Ok((client, peer)) => {
                    info!("{} connected", peer);
                    let iom = IoManager::current().expect("on a worker");
                    iom.schedule(Task::call(move || serve(client, peer)));
                }
                Err(e) => {
                    error!("accept: {}", e);
                    break;
                }
            }
        }
    }));
    iom.stop();
}
