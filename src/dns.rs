//! Minimal DNS message codec for the discovery channel.
//!
//! Only what the discovery exchange needs: questions, and answer records whose TXT data is
//! exposed as the concatenation of its character-strings. Authority and additional sections
//! are not read.

use crate::error::WireError;

pub const TYPE_TXT: u16 = 16;
pub const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
// mDNS reuses the top class bit for unicast-response / cache-flush.
const CLASS_MASK: u16 = 0x7fff;
const MAX_LABEL: usize = 63;
const MAX_POINTER_JUMPS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub class: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    /// For TXT records the joined character-strings, otherwise the raw RDATA.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub response: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

/// DNS names compare case-insensitively and ignore a trailing root dot.
pub fn names_match(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

pub fn encode_query(name: &str) -> Result<Vec<u8>, WireError> {
    let mut buf = header(0, 1, 0);
    encode_name(&mut buf, name)?;
    buf.extend_from_slice(&TYPE_TXT.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(buf)
}

pub fn encode_txt_answer(name: &str, ttl: u32, text: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut buf = header(FLAG_RESPONSE | FLAG_AUTHORITATIVE, 0, 1);
    encode_name(&mut buf, name)?;
    buf.extend_from_slice(&TYPE_TXT.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    buf.extend_from_slice(&ttl.to_be_bytes());

    let mut rdata = Vec::with_capacity(text.len() + text.len() / 255 + 1);
    if text.is_empty() {
        rdata.push(0);
    }
    for chunk in text.chunks(255) {
        rdata.push(chunk.len() as u8);
        rdata.extend_from_slice(chunk);
    }
    buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    buf.extend_from_slice(&rdata);
    Ok(buf)
}

pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
    let mut r = Reader { buf, pos: 0 };
    let _id = r.u16()?;
    let flags = r.u16()?;
    let qdcount = r.u16()?;
    let ancount = r.u16()?;
    let _nscount = r.u16()?;
    let _arcount = r.u16()?;

    let mut questions = Vec::new();
    for _ in 0..qdcount {
        let name = r.name()?;
        let qtype = r.u16()?;
        let class = r.u16()? & CLASS_MASK;
        questions.push(Question { name, qtype, class });
    }

    let mut answers = Vec::new();
    for _ in 0..ancount {
        let name = r.name()?;
        let rtype = r.u16()?;
        let class = r.u16()? & CLASS_MASK;
        let ttl = r.u32()?;
        let len = r.u16()? as usize;
        let rdata = r.take(len)?;
        let data = if rtype == TYPE_TXT {
            join_txt(rdata).ok_or(WireError::Truncated(r.pos))?
        } else {
            rdata.to_vec()
        };
        answers.push(Record {
            name,
            rtype,
            class,
            ttl,
            data,
        });
    }

    Ok(Packet {
        response: flags & FLAG_RESPONSE != 0,
        questions,
        answers,
    })
}

fn header(flags: u16, qdcount: u16, ancount: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&0u16.to_be_bytes()); // mDNS id is zero
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&qdcount.to_be_bytes());
    buf.extend_from_slice(&ancount.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0]);
    debug_assert_eq!(buf.len(), HEADER_LEN);
    buf
}

fn encode_name(buf: &mut Vec<u8>, name: &str) -> Result<(), WireError> {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL {
            return Err(WireError::LabelTooLong(label.len()));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

fn join_txt(mut rdata: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(rdata.len());
    while let Some((&len, rest)) = rdata.split_first() {
        let len = len as usize;
        if rest.len() < len {
            return None;
        }
        out.extend_from_slice(&rest[..len]);
        rdata = &rest[len..];
    }
    Some(out)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated(self.pos))?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a possibly compressed name. The cursor ends after the first pointer, if any.
    fn name(&mut self) -> Result<String, WireError> {
        let mut labels: Vec<String> = Vec::new();
        let mut cursor = self.pos;
        let mut resume: Option<usize> = None;
        let mut jumps = 0;

        loop {
            let len = *self.buf.get(cursor).ok_or(WireError::Truncated(cursor))? as usize;
            match len & 0xc0 {
                0x00 => {
                    cursor += 1;
                    if len == 0 {
                        break;
                    }
                    let label = self
                        .buf
                        .get(cursor..cursor + len)
                        .ok_or(WireError::Truncated(cursor))?;
                    labels.push(String::from_utf8_lossy(label).into_owned());
                    cursor += len;
                }
                0xc0 => {
                    let low = *self.buf.get(cursor + 1).ok_or(WireError::Truncated(cursor))?;
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        return Err(WireError::PointerLoop);
                    }
                    if resume.is_none() {
                        resume = Some(cursor + 2);
                    }
                    cursor = ((len & 0x3f) << 8) | low as usize;
                }
                _ => return Err(WireError::LabelTooLong(len)),
            }
        }

        self.pos = resume.unwrap_or(cursor);
        Ok(labels.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_decodes_to_single_txt_question() {
        let packet = decode(&encode_query("ZeroCloud").unwrap()).unwrap();
        assert!(!packet.response);
        assert_eq!(
            packet.questions,
            vec![Question {
                name: "ZeroCloud".into(),
                qtype: TYPE_TXT,
                class: CLASS_IN
            }]
        );
        assert!(packet.answers.is_empty());
    }

    #[test]
    fn long_txt_payload_is_split_and_rejoined() {
        let text = vec![b'x'; 600];
        let bytes = encode_txt_answer("ZeroCloud", 120, &text).unwrap();
        let packet = decode(&bytes).unwrap();
        assert!(packet.response);
        assert_eq!(packet.answers.len(), 1);
        assert_eq!(packet.answers[0].data, text);
        assert_eq!(packet.answers[0].ttl, 120);
    }

    #[test]
    fn compressed_answer_name_follows_pointer() {
        // Question "zerocloud", answer name is a pointer back to offset 12.
        let mut buf = vec![0, 0, 0x84, 0, 0, 1, 0, 1, 0, 0, 0, 0];
        buf.extend_from_slice(b"\x09zerocloud\x00");
        buf.extend_from_slice(&[0, 16, 0, 1]);
        buf.extend_from_slice(&[0xc0, 12, 0, 16, 0x80, 1, 0, 0, 0, 10, 0, 3]);
        buf.extend_from_slice(b"\x02hi");

        let packet = decode(&buf).unwrap();
        assert_eq!(packet.answers[0].name, "zerocloud");
        assert_eq!(packet.answers[0].class, CLASS_IN);
        assert_eq!(packet.answers[0].data, b"hi");
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut buf = vec![0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        buf.extend_from_slice(&[0xc0, 12, 0, 16, 0, 1]);
        assert_eq!(decode(&buf), Err(WireError::PointerLoop));
    }

    #[test]
    fn truncated_packets_are_errors() {
        let bytes = encode_txt_answer("ZeroCloud", 120, b"{}").unwrap();
        for cut in [0, 5, 13, bytes.len() - 1] {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn names_match_ignores_case_and_root_dot() {
        assert!(names_match("zerocloud", "ZeroCloud"));
        assert!(names_match("ZEROCLOUD.", "ZeroCloud"));
        assert!(!names_match("ZeroCloudX", "ZeroCloud"));
    }
}
