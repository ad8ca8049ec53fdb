use std::io::{Read, Write};

use declink::{Config, Stack};

fn main() {
    env_logger::init();

    let stack = Stack::new("tap1", "1.11".parse().unwrap(), Config::default()).unwrap();

    let mut stream = stack
        .connect("1.10".parse().unwrap(), "ECHO", b"hello")
        .unwrap();

    stream.write(b"ping over nsp").unwrap();
    stream.flush().unwrap();

    let mut buf = [0u8; 1500];
    let n = stream.read(&mut buf).unwrap();

    println!("{:?}", &buf[..n]);
}
