/* MessagePack RPC client for the fieldd daemon.
 *
 * The wire format is a u32 little-endian length prefix followed by one
 * MessagePack-encoded request or response. The definitions here must
 * stay in lockstep with the daemon's `rpc` module. */

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/* An untyped parameter value; the daemon coerces it against the
 * device schema. */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::UInt(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/* Parse a command-line value: bool, integer, then float. */
pub fn parse_param_value(text: &str) -> Result<ParamValue> {
    if let Ok(v) = text.parse::<bool>() {
        return Ok(ParamValue::Bool(v));
    }
    if let Ok(v) = text.parse::<i64>() {
        return Ok(ParamValue::Int(v));
    }
    if let Ok(v) = text.parse::<u64>() {
        return Ok(ParamValue::UInt(v));
    }
    if let Ok(v) = text.parse::<f64>() {
        return Ok(ParamValue::Float(v));
    }
    anyhow::bail!("\"{text}\" is not a boolean, integer or float")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub uid: String,
    pub type_id: u16,
    pub type_name: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub uid: String,
    pub type_name: String,
    pub delay_ms: u16,
    pub params: Vec<(String, ParamValue, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetVersion,
    GetTime,
    GetFieldParameters,
    SetAlliance { alliance: String },
    SetStartingZone { zone: String },
    SetMode { mode: String },
    GetDeviceNames,
    SetDeviceName { name: String, uid: String },
    DelDeviceName { uid: String },
    RegisterDevice { descriptor: DeviceDescriptor },
    UnregisterDevice { uid: String },
    RunChallenge { seed: i64, timeout: f64 },
    GetChallengeSolution,
    ListDevices,
    SubscribeDevice { uid: String, params: Vec<String>, delay: u16 },
    WriteParams { uid: String, values: Vec<(String, ParamValue)> },
    ReadParams { uid: String, params: Vec<String> },
    Enumerate,
    DisableAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Version { major: u16, minor: u16, patch: u16 },
    Time { seconds: f64 },
    FieldParameters { alliance: String, starting_zone: String, mode: String },
    DeviceNames { names: HashMap<String, String> },
    Devices { devices: Vec<DeviceSnapshot> },
    Values { values: Vec<(String, ParamValue, f64)> },
    ChallengeSolution { solution: Option<i64> },
    Error { message: String },
}

pub struct FieldClient {
    stream: TcpStream,
}

impl FieldClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connecting to fieldd at {host}:{port}"))?;
        Ok(Self { stream })
    }

    /* One call, one reply. A daemon-side error becomes an Err so the
     * CLI exits nonzero. */
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        let response = tokio::time::timeout(CALL_TIMEOUT, self.exchange(&request))
            .await
            .context("RPC call timed out")??;
        match response {
            Response::Error { message } => anyhow::bail!("daemon error: {message}"),
            response => Ok(response),
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response> {
        let body = rmp_serde::to_vec_named(request).context("encoding request")?;
        self.stream
            .write_all(&(body.len() as u32).to_le_bytes())
            .await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;

        let mut prefix = [0u8; 4];
        self.stream.read_exact(&mut prefix).await?;
        let len = u32::from_le_bytes(prefix) as usize;
        let mut reply = vec![0u8; len];
        self.stream.read_exact(&mut reply).await?;
        rmp_serde::from_slice(&reply).context("decoding response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_value() {
        assert_eq!(parse_param_value("true").unwrap(), ParamValue::Bool(true));
        assert_eq!(parse_param_value("-3").unwrap(), ParamValue::Int(-3));
        assert_eq!(parse_param_value("0.5").unwrap(), ParamValue::Float(0.5));
        assert!(parse_param_value("banana").is_err());
    }

    #[test]
    fn test_request_encoding_is_stable() {
        /* The daemon decodes by variant name; a rename would break the
         * protocol. */
        let bytes = rmp_serde::to_vec_named(&Request::GetVersion).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("GetVersion"));
    }
}
