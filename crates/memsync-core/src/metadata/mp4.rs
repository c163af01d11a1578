//! Freeform (`----`) atom writer for MP4/QuickTime containers.
//!
//! The payload lands under `moov/udta/meta/ilst`. When `moov` sits in front of the
//! media data its growth moves every sample, so `stco`/`co64` chunk offsets are shifted.

use super::EmbedError;

pub const FREEFORM_MEAN: &str = "com.snapchat";
pub const FREEFORM_NAME: &str = "metadata";

const DATA_TYPE_UTF8: u32 = 1;

#[derive(Debug, Clone, Copy)]
struct Atom {
    kind: [u8; 4],
    start: usize,
    header: usize,
    end: usize,
}

impl Atom {
    fn body<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start + self.header..self.end]
    }

    fn raw<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn malformed(msg: &str) -> EmbedError {
    EmbedError::Container(msg.to_string())
}

fn parse_atoms(buf: &[u8]) -> Result<Vec<Atom>, EmbedError> {
    let mut atoms = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        if buf.len() - pos < 8 {
            return Err(malformed("truncated atom header"));
        }
        let size32 = be_u32(&buf[pos..]);
        let kind = [buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]];
        let (size, header) = match size32 {
            0 => ((buf.len() - pos) as u64, 8),
            1 => {
                if buf.len() - pos < 16 {
                    return Err(malformed("truncated extended atom header"));
                }
                (be_u64(&buf[pos + 8..]), 16)
            }
            s => (s as u64, 8),
        };
        if size < header as u64 || size > (buf.len() - pos) as u64 {
            return Err(malformed("atom size out of bounds"));
        }
        let end = pos + size as usize;
        atoms.push(Atom {
            kind,
            start: pos,
            header,
            end,
        });
        pos = end;
    }
    Ok(atoms)
}

fn atom(kind: &[u8; 4], body: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let size = u32::try_from(body.len() + 8).map_err(|_| malformed("atom too large"))?;
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    Ok(out)
}

fn full_atom_body(payload: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; 4];
    body.extend_from_slice(payload);
    body
}

fn freeform_atom(payload: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let mut body = atom(b"mean", &full_atom_body(FREEFORM_MEAN.as_bytes()))?;
    body.extend(atom(b"name", &full_atom_body(FREEFORM_NAME.as_bytes()))?);

    let mut data = DATA_TYPE_UTF8.to_be_bytes().to_vec();
    data.extend_from_slice(&[0, 0, 0, 0]);
    data.extend_from_slice(payload);
    body.extend(atom(b"data", &data)?);

    atom(b"----", &body)
}

fn is_own_freeform(body: &[u8]) -> bool {
    let Ok(children) = parse_atoms(body) else {
        return false;
    };
    let text = |kind: &[u8; 4]| {
        children
            .iter()
            .find(|a| &a.kind == kind)
            .map(|a| a.body(body))
            .filter(|b| b.len() >= 4)
            .map(|b| &b[4..])
    };
    text(b"mean") == Some(FREEFORM_MEAN.as_bytes()) && text(b"name") == Some(FREEFORM_NAME.as_bytes())
}

fn handler_atom() -> Result<Vec<u8>, EmbedError> {
    let mut body = vec![0u8; 8];
    body.extend_from_slice(b"mdir");
    body.extend_from_slice(b"appl");
    body.extend_from_slice(&[0u8; 8]);
    body.push(0);
    atom(b"hdlr", &body)
}

fn rebuild_ilst(body: &[u8], payload: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let mut out = Vec::with_capacity(body.len() + payload.len() + 64);
    for child in parse_atoms(body)? {
        if &child.kind == b"----" && is_own_freeform(child.body(body)) {
            continue;
        }
        out.extend_from_slice(child.raw(body));
    }
    out.extend(freeform_atom(payload)?);
    Ok(out)
}

fn rebuild_meta(body: &[u8], payload: &[u8]) -> Result<Vec<u8>, EmbedError> {
    if body.len() < 4 {
        return Err(malformed("meta atom too short"));
    }
    let children_buf = &body[4..];
    let mut out = body[..4].to_vec();
    let mut replaced = false;
    for child in parse_atoms(children_buf)? {
        if &child.kind == b"ilst" && !replaced {
            out.extend(atom(b"ilst", &rebuild_ilst(child.body(children_buf), payload)?)?);
            replaced = true;
        } else {
            out.extend_from_slice(child.raw(children_buf));
        }
    }
    if !replaced {
        out.extend(atom(b"ilst", &rebuild_ilst(&[], payload)?)?);
    }
    Ok(out)
}

fn new_meta(payload: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let mut body = vec![0u8; 4];
    body.extend(handler_atom()?);
    body.extend(atom(b"ilst", &rebuild_ilst(&[], payload)?)?);
    Ok(body)
}

fn rebuild_udta(body: &[u8], payload: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let mut out = Vec::with_capacity(body.len() + payload.len() + 128);
    let mut replaced = false;
    for child in parse_atoms(body)? {
        if &child.kind == b"meta" && !replaced {
            out.extend(atom(b"meta", &rebuild_meta(child.body(body), payload)?)?);
            replaced = true;
        } else {
            out.extend_from_slice(child.raw(body));
        }
    }
    if !replaced {
        out.extend(atom(b"meta", &new_meta(payload)?)?);
    }
    Ok(out)
}

fn rebuild_moov(body: &[u8], payload: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let mut out = Vec::with_capacity(body.len() + payload.len() + 160);
    let mut replaced = false;
    for child in parse_atoms(body)? {
        if &child.kind == b"udta" && !replaced {
            out.extend(atom(b"udta", &rebuild_udta(child.body(body), payload)?)?);
            replaced = true;
        } else {
            out.extend_from_slice(child.raw(body));
        }
    }
    if !replaced {
        out.extend(atom(b"udta", &rebuild_udta(&[], payload)?)?);
    }
    Ok(out)
}

fn shift_chunk_offsets(buf: &mut [u8], threshold: u64, delta: i64) -> Result<(), EmbedError> {
    for a in parse_atoms(buf)? {
        let body = &mut buf[a.start + a.header..a.end];
        match &a.kind {
            b"trak" | b"mdia" | b"minf" | b"stbl" => shift_chunk_offsets(body, threshold, delta)?,
            b"stco" | b"co64" => {
                let width = if &a.kind == b"stco" { 4 } else { 8 };
                if body.len() < 8 {
                    return Err(malformed("chunk offset table too short"));
                }
                let count = be_u32(&body[4..]) as usize;
                if body.len() < 8 + count * width {
                    return Err(malformed("chunk offset table truncated"));
                }
                for i in 0..count {
                    let at = 8 + i * width;
                    let old = if width == 4 {
                        be_u32(&body[at..]) as u64
                    } else {
                        be_u64(&body[at..])
                    };
                    if old < threshold {
                        continue;
                    }
                    let new = old
                        .checked_add_signed(delta)
                        .ok_or_else(|| malformed("chunk offset overflow"))?;
                    if width == 4 {
                        let new = u32::try_from(new).map_err(|_| malformed("chunk offset overflow"))?;
                        body[at..at + 4].copy_from_slice(&new.to_be_bytes());
                    } else {
                        body[at..at + 8].copy_from_slice(&new.to_be_bytes());
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Store `payload` as the vendor freeform atom, replacing any previous one.
pub fn embed_freeform(file: &[u8], payload: &[u8]) -> Result<Vec<u8>, EmbedError> {
    let top = parse_atoms(file)?;
    let moov = top
        .iter()
        .find(|a| &a.kind == b"moov")
        .copied()
        .ok_or_else(|| malformed("no moov atom"))?;

    let mut new_moov = atom(b"moov", &rebuild_moov(moov.body(file), payload)?)?;
    let delta = new_moov.len() as i64 - (moov.end - moov.start) as i64;
    let media_after_moov = top.iter().any(|a| &a.kind == b"mdat" && a.start > moov.start);
    if media_after_moov && delta != 0 {
        shift_chunk_offsets(&mut new_moov[8..], moov.end as u64, delta)?;
    }

    let mut out = Vec::with_capacity(file.len() + new_moov.len());
    out.extend_from_slice(&file[..moov.start]);
    out.extend_from_slice(&new_moov);
    out.extend_from_slice(&file[moov.end..]);
    Ok(out)
}

/// Read back the vendor freeform payload, if present.
pub fn read_freeform(file: &[u8]) -> Option<Vec<u8>> {
    let find = |buf: &[u8], kind: &[u8; 4]| -> Option<Atom> {
        parse_atoms(buf).ok()?.into_iter().find(|a| &a.kind == kind)
    };
    let moov = find(file, b"moov")?;
    let moov_body = moov.body(file);
    let udta = find(moov_body, b"udta")?;
    let udta_body = udta.body(moov_body);
    let meta = find(udta_body, b"meta")?;
    let meta_children = meta.body(udta_body).get(4..)?;
    let ilst = find(meta_children, b"ilst")?;
    let ilst_body = ilst.body(meta_children);

    parse_atoms(ilst_body)
        .ok()?
        .into_iter()
        .filter(|a| &a.kind == b"----" && is_own_freeform(a.body(ilst_body)))
        .find_map(|a| {
            let ff = a.body(ilst_body);
            let data = find(ff, b"data")?;
            data.body(ff).get(8..).map(|p| p.to_vec())
        })
}
