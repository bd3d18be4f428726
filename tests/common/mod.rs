//! Simulated companion module for end-to-end updater tests.

#![allow(dead_code)]

use base64::Engine as _;
use dfu_engine::engine::transport::{Transport, TransportError};
use dfu_engine::engine::updater::verify::md5_hex;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

pub type EventLog = Rc<RefCell<Vec<String>>>;

/// Answers the module protocol from in-memory state and records every
/// request it sees.
pub struct SimulatedModule {
    pub bundle: Vec<u8>,
    pub source: String,
    pub md5: Option<String>,
    pub ready: bool,
    pub dfu_active: bool,
    /// `dfu.get` polls answered with an error after entry is requested
    pub polls_before_active: u32,
    /// Chunk responses to send with a wrong checksum
    pub corrupt_chunks: u32,
    pub version: (u32, u32, u32),
    pub requests: Vec<Value>,
    pub mode_requests: u32,
    pub done: Option<String>,
    pub error: Option<String>,
    pub host_version: Option<String>,
    pub events: Option<EventLog>,
}

impl SimulatedModule {
    pub fn with_bundle(bundle: Vec<u8>) -> Self {
        let md5 = Some(md5_hex(&bundle));
        Self {
            bundle,
            source: "host-update.tar".to_string(),
            md5,
            ready: true,
            dfu_active: false,
            polls_before_active: 0,
            corrupt_chunks: 0,
            version: (4, 1, 1),
            requests: Vec::new(),
            mode_requests: 0,
            done: None,
            error: None,
            host_version: None,
            events: None,
        }
    }

    pub fn idle() -> Self {
        Self {
            ready: false,
            ..Self::with_bundle(Vec::new())
        }
    }

    pub fn log_to(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Requests sent with the given `req` name.
    pub fn sent(&self, name: &str) -> Vec<&Value> {
        self.requests.iter().filter(|r| r["req"] == name).collect()
    }

    fn log(&self, event: String) {
        if let Some(events) = &self.events {
            events.borrow_mut().push(event);
        }
    }

    fn status(&mut self, request: &Value) -> Value {
        if request.get("stop").is_some() {
            if let Some(err) = request.get("err").and_then(Value::as_str) {
                self.error = Some(err.to_string());
                self.log(format!("module: error {}", err));
            } else if let Some(status) = request.get("status").and_then(Value::as_str) {
                self.done = Some(status.to_string());
                self.log(format!("module: done {}", status));
            }
            self.ready = false;
            return json!({});
        }
        if let Some(version) = request.get("version").and_then(Value::as_str) {
            self.host_version = Some(version.to_string());
            return json!({});
        }
        if !self.ready {
            return json!({"mode": "idle"});
        }
        let mut body = json!({"source": self.source, "length": self.bundle.len(), "type": "host"});
        if let Some(md5) = &self.md5 {
            body["md5"] = json!(md5);
        }
        json!({"mode": "ready", "body": body})
    }

    fn get(&mut self, request: &Value) -> Value {
        let Some(length) = request.get("length").and_then(Value::as_u64) else {
            if !self.dfu_active && self.mode_requests > 0 {
                if self.polls_before_active == 0 {
                    self.dfu_active = true;
                } else {
                    self.polls_before_active -= 1;
                }
            }
            return if self.dfu_active {
                json!({})
            } else {
                json!({"err": "update mode not active {dfu-not-ready}"})
            };
        };
        if !self.dfu_active {
            return json!({"err": "update mode not active {dfu-not-ready}"});
        }

        let offset = request["offset"].as_u64().unwrap_or(0) as usize;
        let end = (offset + length as usize).min(self.bundle.len());
        let chunk = &self.bundle[offset..end];
        let status = if self.corrupt_chunks > 0 {
            self.corrupt_chunks -= 1;
            "00000000000000000000000000000000".to_string()
        } else {
            md5_hex(chunk)
        };
        json!({
            "payload": base64::engine::general_purpose::STANDARD.encode(chunk),
            "status": status,
        })
    }
}

impl Transport for SimulatedModule {
    fn transact(&mut self, request: &Value) -> Result<Value, TransportError> {
        self.requests.push(request.clone());
        let response = match request["req"].as_str().unwrap_or_default() {
            "dfu.status" => self.status(request),
            "dfu.get" => self.get(request),
            "hub.set" => {
                match request["mode"].as_str() {
                    Some("dfu") => self.mode_requests += 1,
                    Some("dfu-completed") => {
                        self.dfu_active = false;
                        self.log("module: mode completed".to_string());
                    }
                    _ => {}
                }
                json!({})
            }
            "card.version" => {
                let (major, minor, patch) = self.version;
                json!({
                    "version": format!("notecard-{}.{}.{}", major, minor, patch),
                    "body": {"ver_major": major, "ver_minor": minor, "ver_patch": patch},
                })
            }
            other => json!({"err": format!("unknown request: {}", other)}),
        };
        Ok(response)
    }
}

/// Bundle in the reduced tar layout. Names ending in `/` are directories.
pub fn bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in entries {
        let mut header = vec![0u8; 512];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[124..135].copy_from_slice(format!("{:011o}", data.len()).as_bytes());
        out.extend(header);
        out.extend_from_slice(data);
        let padded = out.len().div_ceil(512) * 512;
        out.resize(padded, 0);
    }
    out.extend(vec![0u8; 512]);
    out
}

/// Bundle of plain files written with the `tar` crate.
pub fn tar_bundle(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}
