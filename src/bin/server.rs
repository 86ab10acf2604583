use std::io::{Read, Write};

use ustack::{NetStack, StackConfig};

fn main() {
    env_logger::init();

    let stack = NetStack::new(StackConfig::default()).unwrap();
    let listener = stack.bind(9090).unwrap();

    println!(">>> waiting for incoming connections on :9090...");
    let mut stream = listener.accept().unwrap();
    println!(">>> connection accepted");

    loop {
        let mut buf = [0u8; 1500];
        let n = stream.read(&mut buf[..]).unwrap();
        if n == 0 {
            break;
        }

        stream.write_all(&buf[..n]).unwrap();
        println!(
            ">>> echoed {} bytes: {:?}",
            n,
            String::from_utf8_lossy(&buf[..n])
        );
    }

    drop(stream);
    stack.join();
}
