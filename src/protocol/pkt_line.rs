//! pkt-line framing
//!
//! Every packet starts with its total length (prefix included) as four hex
//! digits. `0000` is the flush packet separating sections of an exchange.

use crate::protocol::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use std::io::{Read, Write};

pub const FLUSH_PKT: &[u8] = b"0000";
/// Largest packet, length prefix included
pub const MAX_PKT_LEN: usize = 65520;
pub const MAX_PKT_DATA: usize = MAX_PKT_LEN - 4;
/// Payload of one side-band-64k packet, band byte excluded
pub const MAX_SIDEBAND_DATA: usize = MAX_PKT_DATA - 1;

pub const BAND_DATA: u8 = 1;
pub const BAND_PROGRESS: u8 = 2;
pub const BAND_ERROR: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Flush,
    Data(Bytes),
}

impl PktLine {
    /// Payload as text with one trailing newline removed.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PktLine::Flush => None,
            PktLine::Data(data) => {
                let text = std::str::from_utf8(data).ok()?;
                Some(text.strip_suffix('\n').unwrap_or(text))
            }
        }
    }
}

#[derive(Debug)]
pub struct PktLineWriter<W> {
    inner: W,
}

impl<W: Write> PktLineWriter<W> {
    pub fn new(inner: W) -> Self {
        PktLineWriter { inner }
    }

    pub fn write(&mut self, data: &[u8]) -> ProtocolResult<()> {
        if data.len() > MAX_PKT_DATA {
            return Err(ProtocolError::Framing(format!(
                "payload of {} bytes exceeds {MAX_PKT_DATA}",
                data.len()
            )));
        }

        write!(self.inner, "{:04x}", data.len() + 4)?;
        self.inner.write_all(data)?;
        Ok(())
    }

    pub fn write_line(&mut self, line: &str) -> ProtocolResult<()> {
        if line.ends_with('\n') {
            self.write(line.as_bytes())
        } else {
            self.write(format!("{line}\n").as_bytes())
        }
    }

    pub fn flush_pkt(&mut self) -> ProtocolResult<()> {
        self.inner.write_all(FLUSH_PKT)?;
        Ok(())
    }

    /// Send `data` on a side-band channel, split into maximal packets.
    pub fn write_band(&mut self, band: u8, data: &[u8]) -> ProtocolResult<()> {
        let mut packet = Vec::with_capacity(MAX_PKT_DATA);
        for chunk in data.chunks(MAX_SIDEBAND_DATA) {
            packet.clear();
            packet.push(band);
            packet.extend_from_slice(chunk);
            self.write(&packet)?;
        }
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[derive(Debug)]
pub struct PktLineReader<R> {
    inner: R,
}

impl<R: Read> PktLineReader<R> {
    pub fn new(inner: R) -> Self {
        PktLineReader { inner }
    }

    /// Next packet, or `None` at a clean end of input.
    pub fn read(&mut self) -> ProtocolResult<Option<PktLine>> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = self.inner.read(&mut prefix[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Framing("truncated length prefix".to_string()));
            }
            filled += n;
        }

        let length = std::str::from_utf8(&prefix)
            .ok()
            .and_then(|hex| usize::from_str_radix(hex, 16).ok())
            .ok_or_else(|| {
                ProtocolError::Framing(format!("invalid length prefix {:?}", String::from_utf8_lossy(&prefix)))
            })?;

        match length {
            0 => Ok(Some(PktLine::Flush)),
            1..=3 => Err(ProtocolError::Unsupported(format!("special packet {length:04x}"))),
            _ if length > MAX_PKT_LEN => Err(ProtocolError::Framing(format!(
                "packet of {length} bytes exceeds {MAX_PKT_LEN}"
            ))),
            _ => {
                let mut data = vec![0u8; length - 4];
                self.inner.read_exact(&mut data).map_err(|error| {
                    ProtocolError::Framing(format!("truncated packet: {error}"))
                })?;
                Ok(Some(PktLine::Data(data.into())))
            }
        }
    }

    /// Data packets up to the next flush (or end of input).
    pub fn read_section(&mut self) -> ProtocolResult<Vec<Bytes>> {
        let mut section = Vec::new();
        while let Some(PktLine::Data(data)) = self.read()? {
            section.push(data);
        }
        Ok(section)
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
