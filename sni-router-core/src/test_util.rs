use crate::metrics::MetricsSink;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Totals {
    pub inbound_opened: usize,
    pub inbound_closed: usize,
    pub inbound_bytes_in: usize,
    pub inbound_bytes_out: usize,
    pub outbound_opened: usize,
    pub outbound_closed: usize,
    pub outbound_bytes_in: usize,
    pub outbound_bytes_out: usize,
    pub sni_labels: Vec<String>,
}

/// In-memory sink for asserting on metric events.
#[derive(Debug, Default)]
pub(crate) struct RecordingMetrics {
    totals: Mutex<Totals>,
}

impl RecordingMetrics {
    pub fn totals(&self) -> Totals {
        self.totals.lock().unwrap().clone()
    }

    fn update(&self, f: impl FnOnce(&mut Totals)) {
        f(&mut self.totals.lock().unwrap());
    }
}

impl MetricsSink for RecordingMetrics {
    fn inbound_opened(&self) {
        self.update(|t| t.inbound_opened += 1);
    }
    fn inbound_closed(&self, _open_for: Duration) {
        self.update(|t| t.inbound_closed += 1);
    }
    fn inbound_bytes_in(&self, n: usize) {
        self.update(|t| t.inbound_bytes_in += n);
    }
    fn inbound_bytes_out(&self, n: usize) {
        self.update(|t| t.inbound_bytes_out += n);
    }
    fn sni_parsed(&self, label: &str, _took: Duration) {
        self.update(|t| t.sni_labels.push(label.to_string()));
    }
    fn outbound_opened(&self, _dst: &str, _sni: &str) {
        self.update(|t| t.outbound_opened += 1);
    }
    fn outbound_closed(&self, _dst: &str, _sni: &str, _open_for: Duration) {
        self.update(|t| t.outbound_closed += 1);
    }
    fn outbound_bytes_in(&self, _dst: &str, _sni: &str, n: usize) {
        self.update(|t| t.outbound_bytes_in += n);
    }
    fn outbound_bytes_out(&self, _dst: &str, _sni: &str, n: usize) {
        self.update(|t| t.outbound_bytes_out += n);
    }
}

/// Minimal TLS 1.2 ClientHello record, with a `server_name` extension when
/// `host` is given.
pub(crate) fn client_hello(host: Option<&str>) -> Vec<u8> {
    let mut extensions = vec![0x00, 0x10, 0x00, 0x05, 0x00, 0x03, 0x02, b'h', b'2'];
    if let Some(host) = host {
        let name = host.as_bytes();
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        extensions.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        extensions.push(0x00);
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);
    }

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x11; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    record.push(0x01);
    record.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    record.extend_from_slice(&body);
    record
}
