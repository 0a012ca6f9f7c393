use serde::Deserialize;

use crate::api::base::parse_numeric;
use crate::api::exchange::ExchangeCode;
use crate::api::quote::Market;

/// Realtime transaction ids carried in data-frame headers.
pub const TR_DOMESTIC_TICK: &str = "H0STCNT0";
pub const TR_OVERSEAS_TICK: &str = "HDFSCNT0";

/// Header fields of a data frame: `flag|tr_id|tr_key|body`.
const MIN_FRAME_PARTS: usize = 4;
/// Domestic body: symbol^time^price^sign^change^rate^...
const MIN_DOMESTIC_FIELDS: usize = 6;
/// Overseas body: rsym^...^price(3)^sign(4)^change(5)^rate(6)^...
const MIN_OVERSEAS_FIELDS: usize = 11;

/// One decoded realtime price update.
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: String,
    pub market: Market,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    /// Trade time as sent (HHMMSS), when present.
    pub time: Option<String>,
}

/// A JSON control/acknowledgement message from the streaming endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlMessage {
    pub header: ControlHeader,
    #[serde(default)]
    pub body: Option<ControlBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlHeader {
    #[serde(default)]
    pub tr_id: String,
    #[serde(default)]
    pub tr_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlBody {
    #[serde(default)]
    pub rt_cd: Option<String>,
    #[serde(default)]
    pub msg_cd: Option<String>,
    #[serde(default)]
    pub msg1: Option<String>,
}

impl ControlMessage {
    /// Keepalive probe; the endpoint expects it echoed back verbatim.
    pub fn is_ping(&self) -> bool {
        self.header.tr_id == "PINGPONG"
    }
}

/// A decoded inbound text frame.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Control(ControlMessage),
    Tick(Tick),
    /// A well-formed data frame for a tr_id this gateway does not consume.
    Unrecognized,
}

/// Decode failures are logged and dropped by the caller; one bad frame must
/// never interrupt the stream.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("malformed control frame: {0}")]
    Control(#[from] serde_json::Error),
    #[error("data frame has {got} parts, expected at least {min}")]
    ShortFrame { got: usize, min: usize },
    #[error("{tr_id} body has {got} fields, expected at least {min}")]
    ShortBody {
        tr_id: String,
        got: usize,
        min: usize,
    },
    #[error("{tr_id} frame carries no parseable price")]
    BadPrice { tr_id: String },
}

/// Parse one inbound text frame. Frames starting with `{` are JSON control
/// messages; everything else is `flag|tr_id|tr_key|f1^f2^...^fN` with a
/// body layout keyed by `tr_id`.
pub fn parse_frame(raw: &str) -> Result<StreamFrame, FrameError> {
    if raw.starts_with('{') {
        let control: ControlMessage = serde_json::from_str(raw)?;
        return Ok(StreamFrame::Control(control));
    }

    let parts: Vec<&str> = raw.split('|').collect();
    if parts.len() < MIN_FRAME_PARTS {
        return Err(FrameError::ShortFrame {
            got: parts.len(),
            min: MIN_FRAME_PARTS,
        });
    }

    match parts[1] {
        TR_DOMESTIC_TICK => parse_domestic(parts[3]).map(StreamFrame::Tick),
        TR_OVERSEAS_TICK => parse_overseas(parts[3]).map(StreamFrame::Tick),
        _ => Ok(StreamFrame::Unrecognized),
    }
}

/// Domestic layout: `symbol^time^price^sign^change^rate^...`. The up/down
/// indicator is carried separately from the unsigned change magnitude.
fn parse_domestic(body: &str) -> Result<Tick, FrameError> {
    let fields: Vec<&str> = body.split('^').collect();
    if fields.len() < MIN_DOMESTIC_FIELDS {
        return Err(FrameError::ShortBody {
            tr_id: TR_DOMESTIC_TICK.to_string(),
            got: fields.len(),
            min: MIN_DOMESTIC_FIELDS,
        });
    }

    let price = parse_numeric(fields[2])
        .filter(|p| *p > 0.0)
        .ok_or_else(|| FrameError::BadPrice {
            tr_id: TR_DOMESTIC_TICK.to_string(),
        })?;
    let magnitude = parse_numeric(fields[4]).unwrap_or(0.0);
    let rate = parse_numeric(fields[5]).unwrap_or(0.0);

    Ok(Tick {
        symbol: fields[0].to_string(),
        market: Market::Kr,
        price,
        change: signed_change(fields[3], magnitude),
        change_percent: rate,
        time: non_empty(fields[1]),
    })
}

/// Overseas layout: the realtime key at field 0 is exchange-prefixed
/// (`DNASAAPL`); published ticks are keyed by the bare ticker so lookups by
/// subscription symbol match.
fn parse_overseas(body: &str) -> Result<Tick, FrameError> {
    let fields: Vec<&str> = body.split('^').collect();
    if fields.len() < MIN_OVERSEAS_FIELDS {
        return Err(FrameError::ShortBody {
            tr_id: TR_OVERSEAS_TICK.to_string(),
            got: fields.len(),
            min: MIN_OVERSEAS_FIELDS,
        });
    }

    let price = parse_numeric(fields[3])
        .filter(|p| *p > 0.0)
        .ok_or_else(|| FrameError::BadPrice {
            tr_id: TR_OVERSEAS_TICK.to_string(),
        })?;
    let magnitude = parse_numeric(fields[5]).unwrap_or(0.0);
    let rate = parse_numeric(fields[6]).unwrap_or(0.0);

    Ok(Tick {
        symbol: ExchangeCode::strip_stream_prefix(fields[0]).to_string(),
        market: Market::Us,
        price,
        change: signed_change(fields[4], magnitude),
        change_percent: rate,
        time: None,
    })
}

/// Sign codes: 1 upper-limit, 2 up, 3 flat, 4 lower-limit, 5 down. Codes 4
/// and 5 negate the magnitude.
fn signed_change(sign: &str, magnitude: f64) -> f64 {
    if sign == "4" || sign == "5" {
        -magnitude.abs()
    } else {
        magnitude.abs()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
