//! The interactive `raftkv-client` REPL (SPEC_FULL.md §4.9). Mirrors the
//! original Go client almost line for line: read a line, validate it, try
//! the cluster's nodes in a random order until one answers, print the
//! response body. `EXIT` quits.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};

use rand::seq::SliceRandom;

use raftkv::config::PeerRegistry;
use raftkv::kv::Command;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut args = std::env::args().skip(1);
    let peers_file = loop {
        match args.next().as_deref() {
            Some("--peers-file") => break args.next().expect("--peers-file needs a value"),
            Some(_) => continue,
            None => {
                eprintln!("usage: raftkv-client --peers-file <path>");
                std::process::exit(1);
            }
        }
    };

    let registry = match PeerRegistry::load(peers_file.as_ref()) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if registry.is_empty() {
        eprintln!("peer registry {peers_file} is empty");
        std::process::exit(1);
    }

    let stdin = io::stdin();
    let mut lines = BufReader::new(stdin.lock()).lines();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let Some(Ok(line)) = lines.next() else { break };
        let text = line.trim_end().to_string();
        if text.is_empty() {
            continue;
        }
        if text == "EXIT" {
            println!("HTTP client exiting.");
            return;
        }

        match Command::parse(&text) {
            Ok(command) => match send_to_any_server(&registry, &command, &text) {
                Ok(body) => print!("> {body}"),
                Err(e) => println!("The service is down: {e}"),
            },
            Err(e) => println!("Error: {e}"),
        }
    }
}

/// Picks a uniformly random permutation of the cluster's client addresses and
/// tries each in turn until one accepts the connection, exactly mirroring
/// the original's `rand.Perm(len(allServers))` retry loop.
fn send_to_any_server(registry: &PeerRegistry, command: &Command, raw: &str) -> io::Result<String> {
    let mut addrs: Vec<SocketAddr> = registry
        .all_peers()
        .map(|(_, peer_port)| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), peer_port + 1))
        .collect();
    addrs.shuffle(&mut rand::thread_rng());

    let mut last_err = io::Error::new(io::ErrorKind::NotConnected, "no servers registered");
    for addr in addrs {
        match issue_request(addr, command, raw) {
            Ok(body) => return Ok(body),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn issue_request(addr: SocketAddr, command: &Command, raw: &str) -> io::Result<String> {
    let (method, target, body) = match command {
        Command::Get { key } => ("GET".to_string(), format!("/?key={key}"), String::new()),
        Command::Delete { key } => ("DELETE".to_string(), format!("/?key={key}"), String::new()),
        Command::Set { .. } => ("POST".to_string(), "/".to_string(), raw.to_string()),
    };

    let mut stream = TcpStream::connect(addr)?;
    let request = format!(
        "{method} {target} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes())?;
    read_body(&stream)
}

fn read_body(stream: &TcpStream) -> io::Result<String> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut status_line = String::new();
    reader.read_line(&mut status_line)?;

    let mut content_length = 0usize;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line)? == 0 {
            break;
        }
        let header_line = header_line.trim_end();
        if header_line.is_empty() {
            break;
        }
        if let Some((name, value)) = header_line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = String::new();
    if content_length > 0 {
        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf)?;
        body = String::from_utf8_lossy(&buf).to_string();
    } else {
        reader.read_to_string(&mut body).ok();
    }
    Ok(body)
}
