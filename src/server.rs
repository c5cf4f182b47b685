//! Minimal TCP front-end exposing `Engine` over a line-oriented debug
//! protocol. This is a thin demo collaborator, not the Memcached wire
//! protocol the engine is ultimately meant to sit behind -- framing,
//! connection admission, and the real binary/text protocols are out of
//! scope for the core.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::EngineError;

const HELP: &str = "Commands: SET <key> <value> [ttl=<secs>], ADD <key> <value> [ttl=<secs>], \
REPLACE <key> <value> [ttl=<secs>], GET <key>, DELETE <key>, TOUCH <key> <ttl=<secs>>, \
INCR <key> <delta>, DECR <key> <delta>, APPEND <key> <text>, PREPEND <key> <text>, \
FLUSH_ALL, STATS, HELP";

/// Starts a blocking TCP server handling line commands against `engine`.
pub fn run(addr: &str, engine: Engine) -> io::Result<()> {
    let engine = Arc::new(engine);
    let listener = TcpListener::bind(addr)?;
    log::info!("tqcache demo server listening on {addr}");
    for stream in listener.incoming() {
        let stream = stream?;
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            if let Err(err) = handle_client(stream, &engine) {
                log::warn!("client error: {err}");
            }
        });
    }
    Ok(())
}

fn handle_client(stream: TcpStream, engine: &Engine) -> io::Result<()> {
    let peer = stream.peer_addr().ok();
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    writeln!(writer, "Welcome to tqcache. {HELP}")?;

    for line in reader.lines() {
        let line = line?;
        let response = dispatch(engine, &line);
        writeln!(writer, "{response}")?;
        writer.flush()?;
    }

    if let Some(addr) = peer {
        log::debug!("connection closed: {addr}");
    }
    Ok(())
}

fn dispatch(engine: &Engine, line: &str) -> String {
    match parse_command(line) {
        Command::Store { verb, key, value, ttl } => {
            let ttl = ttl.unwrap_or(Duration::ZERO);
            let result = match verb {
                StoreVerb::Set => engine.set(key.as_bytes(), value.as_bytes(), ttl),
                StoreVerb::Add => engine.add(key.as_bytes(), value.as_bytes(), ttl),
                StoreVerb::Replace => engine.replace(key.as_bytes(), value.as_bytes(), ttl),
            };
            render_cas(result)
        }
        Command::Get { key } => match engine.get(key.as_bytes()) {
            Ok((value, cas)) => format!("VALUE {} cas={cas}", String::from_utf8_lossy(&value)),
            Err(EngineError::KeyNotFound) => "NOT_FOUND".to_string(),
            Err(err) => format!("ERR {err}"),
        },
        Command::Delete { key } => match engine.delete(key.as_bytes()) {
            Ok(()) => "OK".to_string(),
            Err(EngineError::KeyNotFound) => "NOT_FOUND".to_string(),
            Err(err) => format!("ERR {err}"),
        },
        Command::Touch { key, ttl } => render_cas(engine.touch(key.as_bytes(), ttl)),
        Command::Delta { key, delta, increment } => {
            let result = if increment {
                engine.increment(key.as_bytes(), delta)
            } else {
                engine.decrement(key.as_bytes(), delta)
            };
            match result {
                Ok((value, cas)) => format!("VALUE {} cas={cas}", String::from_utf8_lossy(&value)),
                Err(EngineError::KeyNotFound) => "NOT_FOUND".to_string(),
                Err(err) => format!("ERR {err}"),
            }
        }
        Command::Concat { key, text, prepend } => {
            let result = if prepend {
                engine.prepend(key.as_bytes(), text.as_bytes())
            } else {
                engine.append(key.as_bytes(), text.as_bytes())
            };
            render_cas(result)
        }
        Command::FlushAll => match engine.flush_all() {
            Ok(()) => "OK".to_string(),
            Err(err) => format!("ERR {err}"),
        },
        Command::Stats => match engine.stats() {
            Ok(stats) => format!(
                "STAT curr_items {}\r\nSTAT bytes {}\r\nSTAT allocated_bytes {}\r\nSTAT pid {}\r\nSTAT uptime {}\r\nSTAT time {}\r\nSTAT version {}\r\nEND",
                stats.curr_items,
                stats.bytes,
                stats.allocated_bytes,
                stats.pid,
                stats.uptime.as_secs(),
                stats.time,
                stats.version,
            ),
            Err(err) => format!("ERR {err}"),
        },
        Command::Help => HELP.to_string(),
        Command::Invalid => "ERR bad command".to_string(),
    }
}

fn render_cas(result: Result<u64, EngineError>) -> String {
    match result {
        Ok(cas) => format!("STORED cas={cas}"),
        Err(EngineError::KeyNotFound) => "NOT_FOUND".to_string(),
        Err(EngineError::KeyExists) => "EXISTS".to_string(),
        Err(EngineError::CasMismatch) => "EXISTS".to_string(),
        Err(err) => format!("ERR {err}"),
    }
}

enum StoreVerb {
    Set,
    Add,
    Replace,
}

enum Command {
    Store {
        verb: StoreVerb,
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
    Touch {
        key: String,
        ttl: Duration,
    },
    Delta {
        key: String,
        delta: u64,
        increment: bool,
    },
    Concat {
        key: String,
        text: String,
        prepend: bool,
    },
    FlushAll,
    Stats,
    Help,
    Invalid,
}

fn parse_command(line: &str) -> Command {
    let mut parts = line.trim().split_whitespace();
    let verb = match parts.next() {
        Some(verb) => verb.to_ascii_lowercase(),
        None => return Command::Invalid,
    };

    match verb.as_str() {
        "set" | "add" | "replace" => {
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                return Command::Invalid;
            };
            let ttl = parts.next().and_then(parse_ttl_kv);
            if parts.next().is_some() {
                return Command::Invalid;
            }
            let verb = match verb.as_str() {
                "set" => StoreVerb::Set,
                "add" => StoreVerb::Add,
                _ => StoreVerb::Replace,
            };
            Command::Store {
                verb,
                key: key.to_owned(),
                value: value.to_owned(),
                ttl,
            }
        }
        "get" => match (parts.next(), parts.next()) {
            (Some(key), None) => Command::Get { key: key.to_owned() },
            _ => Command::Invalid,
        },
        "delete" => match (parts.next(), parts.next()) {
            (Some(key), None) => Command::Delete { key: key.to_owned() },
            _ => Command::Invalid,
        },
        "touch" => {
            let (Some(key), Some(ttl_token), None) = (parts.next(), parts.next(), parts.next()) else {
                return Command::Invalid;
            };
            match parse_ttl_kv(ttl_token).or_else(|| parse_duration_secs(ttl_token).ok()) {
                Some(ttl) => Command::Touch { key: key.to_owned(), ttl },
                None => Command::Invalid,
            }
        }
        "incr" | "decr" => {
            let (Some(key), Some(delta_token), None) = (parts.next(), parts.next(), parts.next()) else {
                return Command::Invalid;
            };
            match u64::from_str(delta_token) {
                Ok(delta) => Command::Delta {
                    key: key.to_owned(),
                    delta,
                    increment: verb == "incr",
                },
                Err(_) => Command::Invalid,
            }
        }
        "append" | "prepend" => {
            let (Some(key), Some(text), None) = (parts.next(), parts.next(), parts.next()) else {
                return Command::Invalid;
            };
            Command::Concat {
                key: key.to_owned(),
                text: text.to_owned(),
                prepend: verb == "prepend",
            }
        }
        "flush_all" if parts.next().is_none() => Command::FlushAll,
        "stats" if parts.next().is_none() => Command::Stats,
        "help" if parts.next().is_none() => Command::Help,
        _ => Command::Invalid,
    }
}

fn parse_ttl_kv(token: &str) -> Option<Duration> {
    let (key, value) = token.split_once('=')?;
    if key.eq_ignore_ascii_case("ttl") {
        parse_duration_secs(value).ok()
    } else {
        None
    }
}

fn parse_duration_secs(input: &str) -> io::Result<Duration> {
    let seconds = u64::from_str(input)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid TTL"))?;
    Ok(Duration::from_secs(seconds))
}
