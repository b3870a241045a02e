// src/frame.rs
//
// socketcand rawmode text codec.
//
// Frame formats:
//   Handshake: < hi >  < open <bus> >  < ok >  < rawmode >  < ok >  < error >
//   Transmit:  < send <ID_HEX> <DLC> <B0_HEX> ... >
//   Receive:   < frame <ID_HEX> <SECS>.<USECS> <HEXBYTES> >
//
// Parses and formats the bracket-delimited, space-separated token scheme
// socketcand's rawmode protocol uses on the wire.

use crate::error::AdapterError;

/// Maximum data length for classic CAN.
pub const MAX_DLC: usize = 8;

/// The internal CAN frame representation shared by codec and driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanFrame {
    /// 29-bit unsigned identifier (extended form; 11-bit standard is the low subset).
    pub id: u32,
    /// True iff `id` doesn't fit in 11 bits, or the wire form used 29-bit framing.
    pub extended: bool,
    /// Data length, 0..=8.
    pub dlc: u8,
    /// Data bytes, length == dlc.
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self, AdapterError> {
        if data.len() > MAX_DLC {
            return Err(AdapterError::InvalidArgument(format!(
                "dlc {} exceeds classic CAN maximum of {MAX_DLC}",
                data.len()
            )));
        }
        Ok(Self {
            id,
            extended,
            dlc: data.len() as u8,
            data: data.to_vec(),
        })
    }
}

/// Handshake phase, driven by `rawmode_step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    HiSent,
    OpenAcked,
    Established,
    Rejected,
}

/// Minimum response buffer size `rawmode_step` requires (`"< rawmode >"` plus slack).
pub const HANDSHAKE_MIN_BUFFER: usize = 12;

/// Pure handshake driver: given the last message received (None on the very
/// first call), writes the next response into `out` and returns its length
/// plus the new phase.
pub fn rawmode_step(out: &mut [u8], last_message: Option<&[u8]>) -> Result<(usize, Phase), AdapterError> {
    if out.len() < HANDSHAKE_MIN_BUFFER {
        return Err(AdapterError::BufferTooSmall);
    }

    let (response, phase): (&str, Phase) = match last_message {
        None => ("< hi >", Phase::HiSent),
        Some(msg) => {
            let text = std::str::from_utf8(msg).unwrap_or("");
            let text = text.trim();
            if text.starts_with("< open") && text.ends_with('>') {
                ("< ok >", Phase::OpenAcked)
            } else if text == "< rawmode >" {
                ("< ok >", Phase::Established)
            } else {
                ("< error >", Phase::Rejected)
            }
        }
    };

    let bytes = response.as_bytes();
    out[..bytes.len()].copy_from_slice(bytes);
    Ok((bytes.len(), phase))
}

/// Encode a CAN frame plus a caller-supplied monotonic timestamp into the
/// `"< frame <ID> <SECS>.<USECS> <HEX>… >"` wire form, writing into `out`.
/// Returns the number of bytes written.
pub fn encode_frame_into(
    frame: &CanFrame,
    secs: u64,
    usecs: u32,
    out: &mut [u8],
) -> Result<usize, AdapterError> {
    if frame.dlc as usize > MAX_DLC || frame.data.len() != frame.dlc as usize {
        return Err(AdapterError::InvalidArgument("dlc/data length mismatch".into()));
    }

    let mut text = String::with_capacity(32);
    text.push_str("< frame ");
    text.push_str(&format!("{:X}", frame.id));
    text.push(' ');
    text.push_str(&format!("{secs}.{usecs:06}"));
    for byte in &frame.data {
        text.push(' ');
        text.push_str(&format!("{byte:02X}"));
    }
    text.push_str(" >");

    let bytes = text.as_bytes();
    if bytes.len() > out.len() {
        return Err(AdapterError::BufferTooSmall);
    }
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

/// Convenience allocating wrapper around `encode_frame_into`.
pub fn encode_frame(frame: &CanFrame, secs: u64, usecs: u32) -> Result<String, AdapterError> {
    let mut buf = [0u8; 64];
    let n = encode_frame_into(frame, secs, usecs, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Decode `"< send <ID_HEX> <DLC> <B0_HEX> … >"` into a `CanFrame`.
///
/// `extended = (id > 0x7FF) OR (the textual ID had more than 3 hex digits)`.
pub fn decode_send(text: &str) -> Result<CanFrame, AdapterError> {
    let text = text.trim();
    let inner = text
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| AdapterError::InvalidSyntax("missing '<' / '>' delimiters".into()))?
        .trim();

    let mut tokens = inner.split_ascii_whitespace();

    let kw = tokens
        .next()
        .ok_or_else(|| AdapterError::InvalidSyntax("empty message".into()))?;
    if kw != "send" {
        return Err(AdapterError::InvalidSyntax(format!("expected 'send', got '{kw}'")));
    }

    let id_str = tokens
        .next()
        .ok_or_else(|| AdapterError::InvalidSyntax("missing id".into()))?;
    let id = u32::from_str_radix(id_str, 16)
        .map_err(|_| AdapterError::InvalidSyntax(format!("bad hex id '{id_str}'")))?;
    if id > 0x1FFF_FFFF {
        return Err(AdapterError::InvalidSyntax("id exceeds 29 bits".into()));
    }

    let dlc_str = tokens
        .next()
        .ok_or_else(|| AdapterError::InvalidSyntax("missing dlc".into()))?;
    let dlc: usize = dlc_str
        .parse()
        .map_err(|_| AdapterError::InvalidSyntax(format!("bad decimal dlc '{dlc_str}'")))?;
    if dlc > MAX_DLC {
        return Err(AdapterError::InvalidSyntax(format!("dlc {dlc} exceeds {MAX_DLC}")));
    }

    let mut data = Vec::with_capacity(dlc);
    for _ in 0..dlc {
        let byte_str = tokens
            .next()
            .ok_or_else(|| AdapterError::InvalidSyntax("missing data byte".into()))?;
        let byte = u8::from_str_radix(byte_str, 16)
            .map_err(|_| AdapterError::InvalidSyntax(format!("bad hex byte '{byte_str}'")))?;
        data.push(byte);
    }

    if tokens.next().is_some() {
        return Err(AdapterError::InvalidSyntax("excess tokens after data bytes".into()));
    }

    let extended = id > 0x7FF || id_str.len() > 3;

    Ok(CanFrame {
        id,
        extended,
        dlc: dlc as u8,
        data,
    })
}

/// Test-only encoder building a `"< send … >"` line from a frame, with the
/// same hex/decimal formatting `decode_send` expects. Used to exercise the
/// frame round-trip property.
#[cfg(test)]
pub fn encode_send(frame: &CanFrame) -> String {
    let id_width = if frame.extended { 8 } else { 3 };
    let mut text = format!("< send {:0width$X} {}", frame.id, frame.dlc, width = id_width);
    for byte in &frame.data {
        text.push_str(&format!(" {byte:02X}"));
    }
    text.push_str(" >");
    text
}
