//! Update Coordination Protocol
//!
//! Thin request builders over the companion transport. Every call here
//! fails with [`DfuError::Transport`] when the module answers with an `err`
//! field; that is the single error channel for this layer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::error::{DfuError, Result};
use crate::engine::transport::Transport;

const MODULE_ERROR: &str = "Module returned error";

/// Pending update bundle as described by the module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifest {
    /// Name of the bundle on the module side
    pub source: String,
    /// Total bundle length in bytes
    pub length: u64,
    /// Expected whole-file MD5 (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

/// Module firmware version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModuleVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModuleVersion {
    /// Create a version triple
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `"notecard-5.1.1"`, `"v5.1.1.12345"` or `"5.1.1"`.
    pub fn parse(text: &str) -> Option<Self> {
        let start = text.find(|c: char| c.is_ascii_digit())?;
        let mut parts = text[start..]
            .split('.')
            .map(|p| p.trim().parse::<u32>().ok());
        Some(Self {
            major: parts.next()??,
            minor: parts.next()??,
            patch: parts.next().flatten().unwrap_or(0),
        })
    }
}

impl std::fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn transact_checked(transport: &mut dyn Transport, request: Value, context: &str) -> Result<Value> {
    debug!(request = %request, "module request");
    let response = transport.transact(&request)?;
    if let Some(err) = response.get("err") {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(DfuError::transport(context, message));
    }
    Ok(response)
}

fn is_ready(response: &Value) -> bool {
    response.get("mode").and_then(Value::as_str) == Some("ready")
}

/// True iff the module reports a bundle ready to download.
pub fn is_update_available(transport: &mut dyn Transport) -> Result<bool> {
    let response = transact_checked(transport, json!({"req": "dfu.status"}), MODULE_ERROR)?;
    Ok(is_ready(&response))
}

/// Manifest of the pending bundle, or `None` when nothing is ready.
pub fn get_update_info(transport: &mut dyn Transport) -> Result<Option<UpdateManifest>> {
    let mut response = transact_checked(transport, json!({"req": "dfu.status"}), MODULE_ERROR)?;
    if !is_ready(&response) {
        return Ok(None);
    }
    let body = response.get_mut("body").map(Value::take).unwrap_or(Value::Null);
    Ok(Some(serde_json::from_value(body)?))
}

/// Ask the module to enter update mode.
pub fn enter_dfu_mode(transport: &mut dyn Transport) -> Result<()> {
    transact_checked(
        transport,
        json!({"req": "hub.set", "mode": "dfu"}),
        "Module request for update mode entry failed",
    )?;
    Ok(())
}

/// Tell the module the host is finished with update mode.
pub fn exit_dfu_mode(transport: &mut dyn Transport) -> Result<()> {
    transact_checked(
        transport,
        json!({"req": "hub.set", "mode": "dfu-completed"}),
        "Module request for update mode exit failed",
    )?;
    Ok(())
}

/// Poll whether update mode is active. An error field here only means
/// "not yet" and is not raised; a broken link still is.
pub fn is_dfu_mode_active(transport: &mut dyn Transport) -> Result<bool> {
    let response = transport.transact(&json!({"req": "dfu.get"}))?;
    Ok(response.get("err").is_none())
}

/// Report a successful install and clear the pending bundle.
pub fn set_update_done(transport: &mut dyn Transport, message: &str) -> Result<()> {
    transact_checked(
        transport,
        json!({"req": "dfu.status", "stop": true, "status": message}),
        MODULE_ERROR,
    )?;
    Ok(())
}

/// Older module firmware reads `status`, newer reads `err`; send both.
pub fn set_update_error(transport: &mut dyn Transport, message: &str) -> Result<()> {
    transact_checked(
        transport,
        json!({"req": "dfu.status", "stop": true, "err": message, "status": message}),
        MODULE_ERROR,
    )?;
    Ok(())
}

/// Tell the module which host software version is running.
pub fn set_version(transport: &mut dyn Transport, version: &str) -> Result<()> {
    transact_checked(
        transport,
        json!({"req": "dfu.status", "version": version}),
        MODULE_ERROR,
    )?;
    Ok(())
}

/// Allow the module to fetch host updates.
pub fn enable_update(transport: &mut dyn Transport) -> Result<()> {
    transact_checked(transport, json!({"req": "dfu.status", "on": true}), MODULE_ERROR)?;
    Ok(())
}

/// Stop the module from fetching host updates.
pub fn disable_update(transport: &mut dyn Transport) -> Result<()> {
    transact_checked(transport, json!({"req": "dfu.status", "off": true}), MODULE_ERROR)?;
    Ok(())
}

/// Module firmware version from `card.version`.
pub fn get_module_version(transport: &mut dyn Transport) -> Result<ModuleVersion> {
    let response = transact_checked(transport, json!({"req": "card.version"}), MODULE_ERROR)?;

    let body = response.get("body");
    let field = |name: &str| {
        body.and_then(|b| b.get(name))
            .and_then(Value::as_u64)
            .map(|v| v as u32)
    };
    if let (Some(major), Some(minor), Some(patch)) =
        (field("ver_major"), field("ver_minor"), field("ver_patch"))
    {
        return Ok(ModuleVersion::new(major, minor, patch));
    }

    let text = response
        .get("version")
        .or_else(|| body.and_then(|b| b.get("version")))
        .and_then(Value::as_str)
        .unwrap_or_default();
    ModuleVersion::parse(text).ok_or_else(|| DfuError::Version(response.to_string()))
}
