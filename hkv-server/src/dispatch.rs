//! Maps RESP2 command arrays onto [`Server`]'s operation interface. Covers
//! enough of the surface to exercise every operation in spec.md §6; full
//! RESP2 command coverage (and multi-message interactions like `SUBSCRIBE`
//! switching a connection into push mode) stays out of scope per §1/§2.5
//! Non-goals — `Server::subscribe` is reachable directly by a library
//! caller instead.

use std::time::Duration;

use hkv_engine::crdt::{CrdtKind, CrdtValue, InitialValue};
use hkv_engine::TtlStatus;

use crate::protocol::{resp_array, resp_bulk, resp_error, resp_integer, resp_null, resp_simple};
use crate::server::Server;

pub fn dispatch_command(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.is_empty() {
        return resp_error("empty command");
    }
    let cmd = &args[0];
    match_command(cmd, args, server)
}

fn match_command(cmd: &[u8], args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if eq_ignore_ascii_case(cmd, b"PING") {
        return handle_ping(args);
    }
    if eq_ignore_ascii_case(cmd, b"GET") {
        return handle_get(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"SET") {
        return handle_set(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"DEL") {
        return handle_del(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"EXISTS") {
        return handle_exists(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"SCAN") {
        return handle_scan(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"EXPIRE") {
        return handle_expire(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"TTL") {
        return handle_ttl(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"PERSIST") {
        return handle_persist(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"SADD") {
        return handle_sadd(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"SREM") {
        return handle_srem(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"SISMEMBER") {
        return handle_sismember(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"INCRBY") {
        return handle_incrby(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"DECRBY") {
        return handle_decrby(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"GETCOUNTER") {
        return handle_getcounter(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"PUBLISH") {
        return handle_publish(args, server);
    }
    if eq_ignore_ascii_case(cmd, b"INFO") {
        return handle_info(server);
    }

    resp_error("unknown command")
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => resp_bulk(&args[1]),
        _ => resp_error("wrong number of arguments for PING"),
    }
}

fn handle_get(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for GET");
    }
    match server.get(&args[1]) {
        Ok(Some(CrdtValue::LwwRegister(r))) => match r.get() {
            Some(bytes) => resp_bulk(bytes),
            None => resp_null(),
        },
        Ok(Some(_)) => resp_error("key holds a non-scalar CRDT value"),
        Ok(None) => resp_null(),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_set(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() < 3 {
        return resp_error("wrong number of arguments for SET");
    }
    let ttl = if args.len() == 5 && eq_ignore_ascii_case(&args[3], b"EX") {
        match parse_u64(&args[4]) {
            Ok(secs) => Some(Duration::from_secs(secs)),
            Err(resp) => return resp,
        }
    } else if args.len() != 3 {
        return resp_error("unsupported SET options");
    } else {
        None
    };

    match server.set(&args[1], InitialValue::Bytes(args[2].clone()), CrdtKind::Lww, ttl) {
        Ok(_) => resp_simple("OK"),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_del(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for DEL");
    }
    let mut removed = 0i64;
    for key in &args[1..] {
        match server.delete(key) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => return resp_error(&e.to_string()),
        }
    }
    resp_integer(removed)
}

fn handle_exists(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for EXISTS");
    }
    let mut count = 0i64;
    for key in &args[1..] {
        match server.exists(key) {
            Ok(true) => count += 1,
            Ok(false) => {}
            Err(e) => return resp_error(&e.to_string()),
        }
    }
    resp_integer(count)
}

fn handle_scan(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() < 2 || args.len() > 4 {
        return resp_error("wrong number of arguments for SCAN");
    }
    let cursor = match parse_u64(&args[1]) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let pattern = if args.len() >= 3 { String::from_utf8_lossy(&args[2]).into_owned() } else { "*".to_string() };
    let count = if args.len() == 4 {
        match parse_u64(&args[3]) {
            Ok(c) => c as usize,
            Err(resp) => return resp,
        }
    } else {
        10
    };

    match server.scan(cursor, &pattern, count) {
        Ok((next_cursor, keys)) => {
            let mut out = Vec::new();
            out.extend_from_slice(b"*2\r\n");
            out.extend_from_slice(&resp_bulk(next_cursor.to_string().as_bytes()));
            out.extend_from_slice(&resp_array(keys));
            out
        }
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_expire(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for EXPIRE");
    }
    let secs = match parse_u64(&args[2]) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match server.expire(&args[1], Duration::from_secs(secs)) {
        Ok(true) => resp_integer(1),
        Ok(false) => resp_integer(0),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_ttl(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for TTL");
    }
    match server.ttl(&args[1]) {
        Ok(TtlStatus::Missing) => resp_integer(-2),
        Ok(TtlStatus::NoExpiry) => resp_integer(-1),
        Ok(TtlStatus::ExpiresIn(remaining)) => resp_integer(remaining.as_secs() as i64),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_persist(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for PERSIST");
    }
    match server.persist(&args[1]) {
        Ok(true) => resp_integer(1),
        Ok(false) => resp_integer(0),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_sadd(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for SADD");
    }
    match server.crdt_add(&args[1], &args[2]) {
        Ok(_) => resp_integer(1),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_srem(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for SREM");
    }
    match server.crdt_remove(&args[1], &args[2]) {
        Ok(true) => resp_integer(1),
        Ok(false) => resp_integer(0),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_sismember(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for SISMEMBER");
    }
    match server.crdt_contains(&args[1], &args[2]) {
        Ok(true) => resp_integer(1),
        Ok(false) => resp_integer(0),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_incrby(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for INCRBY");
    }
    let amount = match parse_u64(&args[2]) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match server.crdt_increment(&args[1], amount) {
        Ok(_) => match server.crdt_value(&args[1]) {
            Ok(Some(v)) => resp_integer(v),
            Ok(None) => resp_integer(0),
            Err(e) => resp_error(&e.to_string()),
        },
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_decrby(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for DECRBY");
    }
    let amount = match parse_u64(&args[2]) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match server.crdt_decrement(&args[1], amount) {
        Ok(_) => match server.crdt_value(&args[1]) {
            Ok(Some(v)) => resp_integer(v),
            Ok(None) => resp_integer(0),
            Err(e) => resp_error(&e.to_string()),
        },
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_getcounter(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for GETCOUNTER");
    }
    match server.crdt_value(&args[1]) {
        Ok(Some(v)) => resp_integer(v),
        Ok(None) => resp_null(),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_publish(args: &[Vec<u8>], server: &Server) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for PUBLISH");
    }
    match server.publish(&String::from_utf8_lossy(&args[1]), &args[2]) {
        Ok(count) => resp_integer(count as i64),
        Err(e) => resp_error(&e.to_string()),
    }
}

fn handle_info(server: &Server) -> Vec<u8> {
    let info = server.get_info();
    let body = format!(
        "node_id:{}\r\nversion:{}\r\nrole:{}\r\nuptime_secs:{}\r\ndegraded:{}\r\nnum_shards:{}\r\n",
        info.node_id, info.version, info.role, info.uptime_secs, info.degraded, info.num_shards
    );
    resp_bulk(body.as_bytes())
}

fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

fn parse_u64(arg: &[u8]) -> Result<u64, Vec<u8>> {
    if arg.is_empty() {
        return Err(resp_error("invalid integer"));
    }
    let mut value: u64 = 0;
    for &b in arg {
        if !b.is_ascii_digit() {
            return Err(resp_error("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hkv_common::Config;

    fn running_server(name: &str) -> (Server, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("hyperkv-dispatch-test-{name}-{}", std::process::id()));
        let mut config = Config::default();
        config.storage.data_dir = dir.to_string_lossy().to_string();
        config.storage.snapshot_enabled = false;
        config.sharding.num_shards = 2;
        let server = Server::new(config).unwrap();
        server.mark_running_for_test();
        (server, dir)
    }

    #[test]
    fn set_then_get_via_dispatch() {
        let (server, dir) = running_server("set-get");
        let resp = dispatch_command(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()], &server);
        assert_eq!(resp, b"+OK\r\n");
        let resp = dispatch_command(&[b"GET".to_vec(), b"k".to_vec()], &server);
        assert_eq!(resp, b"$1\r\nv\r\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_key_get_returns_null() {
        let (server, dir) = running_server("missing");
        let resp = dispatch_command(&[b"GET".to_vec(), b"nope".to_vec()], &server);
        assert_eq!(resp, b"$-1\r\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn incrby_then_decrby_accumulate() {
        let (server, dir) = running_server("incr");
        dispatch_command(&[b"INCRBY".to_vec(), b"c".to_vec(), b"5".to_vec()], &server);
        let resp = dispatch_command(&[b"DECRBY".to_vec(), b"c".to_vec(), b"2".to_vec()], &server);
        assert_eq!(resp, b":3\r\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
