use std::io::{Read, Write};
use std::net::Ipv4Addr;

use ustack::{NetStack, StackConfig};

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let addr: Ipv4Addr = args
        .next()
        .unwrap_or_else(|| "10.0.0.2".to_string())
        .parse()
        .unwrap();
    let port: u16 = args
        .next()
        .unwrap_or_else(|| "9090".to_string())
        .parse()
        .unwrap();

    let config = StackConfig {
        ifname: "tun1".to_string(),
        ..StackConfig::default()
    };
    let stack = NetStack::new(config).unwrap();

    println!(">>> connecting to {addr}:{port}...");
    let mut stream = stack.connect(addr, port).unwrap();
    println!(">>> connected");

    stream.write_all(b"hello over userspace tcp").unwrap();

    let mut buf = [0u8; 1500];
    let n = stream.read(&mut buf[..]).unwrap();
    println!(">>> echo: {:?}", String::from_utf8_lossy(&buf[..n]));

    drop(stream);
    stack.join();
}
