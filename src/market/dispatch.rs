use crate::error::AppError;
use crate::market::types::{Dispatch, PatchKind, RowWire, RowsWire};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct EnvelopeWire {
    #[serde(rename = "type")]
    kind: Option<String>,
    data: RowsWire,
}

/// Envelopes carry a `type` discriminator; bare arrays and symbol-keyed
/// objects are the legacy full-snapshot format.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundWire {
    Envelope(EnvelopeWire),
    List(Vec<RowWire>),
    Keyed(BTreeMap<String, RowWire>),
}

fn resolve_kind(raw: Option<&str>) -> Result<PatchKind, AppError> {
    match raw {
        Some(value) => PatchKind::parse_str(value),
        None => Ok(PatchKind::FullReplace),
    }
}

/// Parses and classifies one inbound frame. Errors are terminal for this
/// frame only.
pub fn dispatch_frame(payload: &mut [u8], received_at: i64) -> Result<Dispatch, AppError> {
    let wire: InboundWire = simd_json::serde::from_slice(payload)?;

    let (kind, rows) = match wire {
        InboundWire::Envelope(envelope) => (resolve_kind(envelope.kind.as_deref())?, envelope.data),
        InboundWire::List(rows) => (PatchKind::FullReplace, RowsWire::List(rows)),
        InboundWire::Keyed(rows) => (PatchKind::FullReplace, RowsWire::Keyed(rows)),
    };

    let patches = rows.into_patches(kind, received_at)?;
    Ok(Dispatch { kind, patches })
}

pub fn dispatch_text(text: String, received_at: i64) -> Result<Dispatch, AppError> {
    let mut owned_payload = text.into_bytes();
    dispatch_frame(owned_payload.as_mut_slice(), received_at)
}
