//! SNI Extraction Example
//!
//! Classifies a few captured first flights the way the router does before
//! choosing a backend.
//!
//! Run with: cargo run --example sni_extraction

use sni_router_core::{ParsedHello, parse_client_hello};

fn build_sample_client_hello(domain: &str) -> Vec<u8> {
    let domain_bytes = domain.as_bytes();
    let domain_len = domain_bytes.len() as u16;

    let sni_list_len = 3 + domain_len;
    let sni_ext_len = 2 + sni_list_len;
    let extensions_len = 4 + sni_ext_len;
    let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + 2 + extensions_len;
    let record_len = 4 + handshake_len;

    let mut record = vec![
        0x16, 0x03, 0x01,
        (record_len >> 8) as u8,
        (record_len & 0xff) as u8,
        0x01, 0x00,
        (handshake_len >> 8) as u8,
        (handshake_len & 0xff) as u8,
        0x03, 0x03,
    ];
    record.extend_from_slice(&[0; 32]);
    record.extend_from_slice(&[
        0x00,
        0x00, 0x02, 0x13, 0x01,
        0x01, 0x00,
        (extensions_len >> 8) as u8,
        (extensions_len & 0xff) as u8,
        0x00, 0x00,
        (sni_ext_len >> 8) as u8,
        (sni_ext_len & 0xff) as u8,
        (sni_list_len >> 8) as u8,
        (sni_list_len & 0xff) as u8,
        0x00,
        (domain_len >> 8) as u8,
        (domain_len & 0xff) as u8,
    ]);
    record.extend_from_slice(domain_bytes);
    record
}

fn describe(name: &str, data: &[u8]) {
    match parse_client_hello(data) {
        Ok(ParsedHello::Sni(host)) => println!("{name}: TLS, server name {host}"),
        Ok(ParsedHello::NoSni) => println!("{name}: TLS without server name"),
        Ok(ParsedHello::NonTls) => println!("{name}: not TLS"),
        Err(e) => println!("{name}: rejected ({e})"),
    }
}

fn main() {
    let hello = build_sample_client_hello("www.example.com");
    println!("ClientHello record size: {} bytes\n", hello.len());

    describe("client hello", &hello);
    describe("ssh banner", b"SSH-2.0-OpenSSH_9.6\r\n");
    describe("truncated record", &[0x16, 0x03, 0x01]);
    describe("cut short", &hello[..hello.len() - 4]);
}
