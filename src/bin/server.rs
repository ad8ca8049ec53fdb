use std::io::{Read, Write};

use declink::{Config, Stack};

fn main() {
    env_logger::init();

    let stack = Stack::new("tap0", "1.10".parse().unwrap(), Config::default()).unwrap();

    let listener = stack.bind("ECHO").unwrap();

    println!(">>> Waiting for incoming links...");
    let mut stream = listener.accept().unwrap();
    println!(
        ">>> Link accepted (connect data: {:?})",
        stream.connect_data().unwrap()
    );

    loop {
        let mut buf = [0u8; 1500];
        let n = stream.read(&mut buf[..]).unwrap();

        if n == 0 {
            break;
        }

        stream.write(&buf[..n]).unwrap();

        println!(
            "\n>>> Read: {:?}\n",
            String::from_iter(buf[..n].iter().map(|c| *c as char))
        );
    }

    drop(stream);

    stack.join();
}
