//! SOCKS5 Probe Binary
//!
//! Usage: lansocks-probe [OPTIONS]
//!
//! Options:
//!   -t, --test <PROXY> <HOST:PORT>  Connect to HOST:PORT through PROXY
//!   -h, --help                      Print help information

use std::env;
use std::net::IpAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use lansocks::proxy::socks5::{
    Address, ConnectReply, ConnectRequest, MethodResponse, MethodSelection, Reply, METHOD_NO_AUTH,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-t" | "--test" => {
            if args.len() < 4 {
                eprintln!("Error: --test requires a proxy address and a target");
                return Ok(());
            }
            test_connection(&args[2], &args[3]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"lansocks probe - check a SOCKS5 proxy from the client side

USAGE:
    lansocks-probe [OPTIONS]

OPTIONS:
    -t, --test <PROXY> <HOST:PORT>   Greet PROXY and ask it to connect to HOST:PORT
    -h, --help                       Print help information

EXAMPLES:
    Through a proxy on this machine, by name:
        lansocks-probe --test 127.0.0.1:1080 example.com:80

    By IPv6 literal:
        lansocks-probe --test 192.168.1.20:1080 [2001:db8::1]:443
"#
    );
}

async fn test_connection(proxy: &str, target: &str) -> anyhow::Result<()> {
    let (address, port) = parse_target(target)?;

    tracing::info!("Connecting to proxy {}", proxy);
    let mut stream = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(proxy))
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to {}", proxy))??;

    let mut buf = BytesMut::with_capacity(64);

    stream
        .write_all(&MethodSelection::new(vec![METHOD_NO_AUTH]).encode()?)
        .await?;
    let method = read_message(&mut stream, &mut buf, MethodResponse::decode).await?;
    if !method.is_accepted() {
        anyhow::bail!("proxy refused no-auth (method 0x{:02x})", method.method);
    }
    tracing::info!("Greeting accepted");

    tracing::info!("Requesting {}:{}", address, port);
    stream
        .write_all(&ConnectRequest::connect(address, port).encode()?)
        .await?;
    let reply = read_message(&mut stream, &mut buf, ConnectReply::decode).await?;

    if reply.reply == Reply::Succeeded {
        tracing::info!(
            "Connected: reply 0x{:02x} ({}), bound {}:{}",
            reply.reply as u8,
            reply.reply,
            reply.address,
            reply.port
        );
    } else {
        tracing::error!("Proxy answered 0x{:02x}: {}", reply.reply as u8, reply.reply);
    }

    Ok(())
}

/// Read until `decode` yields a whole message.
async fn read_message<S, T>(
    stream: &mut S,
    buf: &mut BytesMut,
    decode: fn(&[u8]) -> lansocks::Result<(T, usize)>,
) -> anyhow::Result<T>
where
    S: AsyncRead + Unpin,
{
    loop {
        match decode(&buf[..]) {
            Ok((message, used)) => {
                buf.advance(used);
                return Ok(message);
            }
            Err(e) if e.is_truncated() => {}
            Err(e) => return Err(e.into()),
        }

        let n = tokio::time::timeout(PROBE_TIMEOUT, stream.read_buf(buf))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the proxy"))??;
        if n == 0 {
            anyhow::bail!("proxy closed the connection mid-message");
        }
    }
}

/// Split `host:port`, accepting `[v6]:port` and bare IP literals.
fn parse_target(target: &str) -> anyhow::Result<(Address, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("target must be HOST:PORT, got {:?}", target))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port in {:?}", target))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let address = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Address::Ipv4(ip),
        Ok(IpAddr::V6(ip)) => Address::Ipv6(ip),
        Err(_) => Address::Domain(host.to_string()),
    };
    Ok((address, port))
}
