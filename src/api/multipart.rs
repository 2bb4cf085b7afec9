//! Minimal `multipart/form-data` reader for upload endpoints.

use anyhow::{anyhow, Result};

#[derive(Debug, PartialEq, Eq)]
pub struct Part<'a> {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: &'a [u8],
}

/// Boundary parameter of a `multipart/form-data` content type.
pub fn boundary(content_type: &str) -> Result<String> {
    let mut params = content_type.split(';').map(str::trim);
    let mime = params.next().unwrap_or_default();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return Err(anyhow!("expected multipart/form-data, got '{mime}'"));
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| unquote(v.trim()).to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| anyhow!("multipart boundary missing"))
}

pub fn parse<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut closing = b"\r\n".to_vec();
    closing.extend_from_slice(&delimiter);

    let mut pos = find(body, &delimiter, 0).ok_or_else(|| anyhow!("multipart body has no parts"))?
        + delimiter.len();
    let mut parts = Vec::new();
    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        if !rest.starts_with(b"\r\n") {
            return Err(anyhow!("malformed multipart delimiter"));
        }
        let headers_start = pos + 2;
        let headers_end = find(body, b"\r\n\r\n", headers_start)
            .ok_or_else(|| anyhow!("multipart part headers not terminated"))?;
        let data_start = headers_end + 4;
        let data_end = find(body, &closing, data_start)
            .ok_or_else(|| anyhow!("multipart part not terminated"))?;

        let headers = std::str::from_utf8(&body[headers_start..headers_end])
            .map_err(|_| anyhow!("multipart headers are not UTF-8"))?;
        parts.push(part_from_headers(headers, &body[data_start..data_end])?);
        pos = data_end + closing.len();
    }
}

/// First part named `name`.
pub fn field<'p, 'a>(parts: &'p [Part<'a>], name: &str) -> Option<&'p Part<'a>> {
    parts.iter().find(|p| p.name == name)
}

fn part_from_headers<'a>(headers: &str, data: &'a [u8]) -> Result<Part<'a>> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                let Some((k, v)) = param.trim().split_once('=') else {
                    continue;
                };
                match k.trim() {
                    "name" => name = Some(unquote(v.trim()).to_string()),
                    "filename" => filename = Some(unquote(v.trim()).to_string()),
                    _ => {}
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string());
        }
    }
    Ok(Part {
        name: name.ok_or_else(|| anyhow!("multipart part without a name"))?,
        filename,
        content_type,
        data,
    })
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
