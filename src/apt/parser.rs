use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read},
};

use color_eyre::eyre::{bail, eyre, Result};
use flate2::read::GzDecoder;

use super::fileinfo::{decode_digest, FileInfo, MD5_LEN, SHA1_LEN, SHA256_LEN};

const CLEARSIGN_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const CLEARSIGN_SIGNATURE: &str = "-----BEGIN PGP SIGNATURE-----";

/// Fields of one control-file paragraph. The first element of a value
/// is the inline part of the field, the rest are continuation lines.
pub type Fields = HashMap<String, Vec<String>>;

/// Whether the index at `p` is one this crate knows how to extract
/// file information from. Compressed variants other than gzip are
/// mirrored but never parsed.
pub fn is_supported(p: &str) -> bool {
    matches!(
        index_base_name(p),
        Some(("Packages" | "Sources" | "Index" | "Release" | "InRelease", _))
    )
}

/// Whether a Release paragraph advertises the by-hash layout.
pub fn support_by_hash(fields: &Fields) -> bool {
    field_value(fields, "Acquire-By-Hash") == Some("yes")
}

fn index_base_name(p: &str) -> Option<(&str, bool)> {
    let base = p.rsplit('/').next().unwrap_or(p);
    if let Some(stem) = base.strip_suffix(".gz") {
        return Some((stem, true));
    }
    for ext in [".xz", ".bz2", ".bzip2", ".lzma"] {
        if base.ends_with(ext) {
            return None;
        }
    }
    Some((base, false))
}

/// Extracts the FileInfo entries referenced by the index at `path`,
/// plus the paragraph fields for Release-style indices. Unrecognized
/// files (signatures, unsupported compressions) yield no entries.
pub fn extract_file_info<R: Read>(path: &str, r: R) -> Result<(Vec<FileInfo>, Fields)> {
    let Some((base, gzipped)) = index_base_name(path) else {
        return Ok((Vec::new(), Fields::new()));
    };

    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(r))
    } else {
        Box::new(r)
    };
    let mut reader = BufReader::new(reader);

    match base {
        "Release" | "InRelease" | "Index" => extract_release(path, &mut reader),
        "Packages" => Ok((extract_packages(&mut reader)?, Fields::new())),
        "Sources" => Ok((extract_sources(&mut reader)?, Fields::new())),
        _ => Ok((Vec::new(), Fields::new())),
    }
}

fn extract_release<B: BufRead>(path: &str, r: &mut B) -> Result<(Vec<FileInfo>, Fields)> {
    let mut text = String::new();
    r.read_to_string(&mut text)?;
    let content = strip_clearsign(&text);

    let Some(fields) = parse_paragraph(&mut content.as_bytes())? else {
        return Ok((Vec::new(), Fields::new()));
    };

    let dir = parent_dir(path);
    let fil = parse_checksum_lists(
        &fields,
        &[
            ("MD5Sum", Algo::Md5),
            ("SHA1", Algo::Sha1),
            ("SHA256", Algo::Sha256),
        ],
        |name| join_relative(dir, name),
    )?;
    Ok((fil, fields))
}

fn extract_packages<B: BufRead>(r: &mut B) -> Result<Vec<FileInfo>> {
    let mut fil = Vec::new();
    while let Some(fields) = parse_paragraph(r)? {
        let filename = field_value(&fields, "Filename")
            .ok_or_else(|| eyre!("Packages stanza without Filename"))?;
        let size: u64 = field_value(&fields, "Size")
            .ok_or_else(|| eyre!("Packages stanza without Size: {filename}"))?
            .parse()?;

        let md5 = field_value(&fields, "MD5sum")
            .map(decode_digest::<MD5_LEN>)
            .transpose()?;
        let sha1 = field_value(&fields, "SHA1")
            .map(decode_digest::<SHA1_LEN>)
            .transpose()?;
        let sha256 = field_value(&fields, "SHA256")
            .map(decode_digest::<SHA256_LEN>)
            .transpose()?;

        fil.push(FileInfo::from_parts(
            filename.to_string(),
            size,
            md5,
            sha1,
            sha256,
        ));
    }
    Ok(fil)
}

fn extract_sources<B: BufRead>(r: &mut B) -> Result<Vec<FileInfo>> {
    let mut fil = Vec::new();
    while let Some(fields) = parse_paragraph(r)? {
        let dir = field_value(&fields, "Directory")
            .ok_or_else(|| eyre!("Sources stanza without Directory"))?;
        let mut entries = parse_checksum_lists(
            &fields,
            &[
                ("Files", Algo::Md5),
                ("Checksums-Sha1", Algo::Sha1),
                ("Checksums-Sha256", Algo::Sha256),
            ],
            |name| join_relative(dir, name),
        )?;
        fil.append(&mut entries);
    }
    Ok(fil)
}

enum Algo {
    Md5,
    Sha1,
    Sha256,
}

#[derive(Default)]
struct DigestSet {
    md5: Option<[u8; MD5_LEN]>,
    sha1: Option<[u8; SHA1_LEN]>,
    sha256: Option<[u8; SHA256_LEN]>,
}

/// Merges `<hex> <size> <name>` checksum lists into one FileInfo per
/// referenced name, in first-seen order.
fn parse_checksum_lists(
    fields: &Fields,
    lists: &[(&str, Algo)],
    join: impl Fn(&str) -> String,
) -> Result<Vec<FileInfo>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut entries: Vec<(String, u64, DigestSet)> = Vec::new();

    for (field, algo) in lists {
        for line in field_lines(fields, field) {
            let mut it = line.split_whitespace();
            let (Some(hexdigest), Some(size), Some(name)) = (it.next(), it.next(), it.next())
            else {
                bail!("malformed checksum line in {field}: {line}");
            };
            let size: u64 = size.parse()?;
            let path = join(name);

            let idx = match index.get(&path) {
                Some(&i) => i,
                None => {
                    index.insert(path.clone(), entries.len());
                    entries.push((path, size, DigestSet::default()));
                    entries.len() - 1
                }
            };
            let (_, known_size, digests) = &mut entries[idx];
            if *known_size != size {
                bail!("inconsistent size for {name}");
            }
            match algo {
                Algo::Md5 => digests.md5 = Some(decode_digest(hexdigest)?),
                Algo::Sha1 => digests.sha1 = Some(decode_digest(hexdigest)?),
                Algo::Sha256 => digests.sha256 = Some(decode_digest(hexdigest)?),
            }
        }
    }

    Ok(entries
        .into_iter()
        .map(|(path, size, d)| FileInfo::from_parts(path, size, d.md5, d.sha1, d.sha256))
        .collect())
}

/// Reads one blank-line-terminated paragraph. Returns None at EOF.
fn parse_paragraph<B: BufRead>(r: &mut B) -> Result<Option<Fields>> {
    let mut fields = Fields::new();
    let mut last_key: Option<String> = None;

    let mut line = String::new();
    loop {
        line.clear();
        if r.read_line(&mut line)? == 0 {
            break;
        }
        let l = line.trim_end_matches(['\n', '\r']);

        if l.trim().is_empty() {
            if fields.is_empty() {
                continue;
            }
            break;
        }

        if l.starts_with(' ') || l.starts_with('\t') {
            let entry = last_key
                .as_ref()
                .and_then(|key| fields.get_mut(key))
                .ok_or_else(|| eyre!("continuation line without a field: {l}"))?;
            entry.push(l.trim().to_string());
            continue;
        }

        let Some((key, value)) = l.split_once(':') else {
            bail!("malformed field line: {l}");
        };
        let key = key.trim().to_string();
        fields
            .entry(key.clone())
            .or_default()
            .push(value.trim().to_string());
        last_key = Some(key);
    }

    if fields.is_empty() {
        Ok(None)
    } else {
        Ok(Some(fields))
    }
}

fn field_value<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    let value = fields.get(key)?.first().map(String::as_str)?;
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn field_lines<'a>(fields: &'a Fields, key: &str) -> impl Iterator<Item = &'a str> {
    fields
        .get(key)
        .into_iter()
        .flatten()
        .map(String::as_str)
        .filter(|l| !l.is_empty())
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn strip_clearsign(text: &str) -> String {
    if !text.starts_with(CLEARSIGN_HEADER) {
        return text.to_string();
    }

    let mut out = String::new();
    let mut lines = text.lines();
    lines.next();

    // armor headers run until the first blank line
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
    }

    for line in lines {
        if line == CLEARSIGN_SIGNATURE {
            break;
        }
        out.push_str(line.strip_prefix("- ").unwrap_or(line));
        out.push('\n');
    }
    out
}
