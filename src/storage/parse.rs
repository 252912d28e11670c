//! Parsers for the storage tool's text output.
//!
//! This is a text protocol owned by the tool, not by us; the layouts pinned
//! by the golden tests below are the ones these parsers accept.

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Newline-separated names (`rbd ls`, `ceph osd pool ls`).
pub fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// `rbd snap ls`: a header line, then rows whose third whitespace-delimited
/// field is the snapshot name. Rows are right-aligned, so the leading padding
/// counts as an (empty) first field. Rows with fewer than three fields are
/// skipped.
pub fn parse_snapshot_list(output: &str) -> Vec<String> {
    output
        .split('\n')
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = WHITESPACE.split(line).collect();
            if parts.len() < 3 {
                return None;
            }
            Some(parts[2].to_string())
        })
        .collect()
}

/// One row of `rbd showmapped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDevice {
    pub id: String,
    pub pool: String,
    pub image: String,
    pub device: String,
}

/// `rbd showmapped`. Columns are located by header name, so both the
/// `id pool image snap device` and the `id pool namespace image snap device`
/// layouts are understood.
pub fn parse_showmapped(output: &str, device_prefix: &str) -> Vec<MappedDevice> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };

    let columns: Vec<String> = header
        .split_whitespace()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let col = |name: &str| columns.iter().position(|c| c == name);
    let (Some(id), Some(pool), Some(image)) = (col("id"), col("pool"), col("image")) else {
        return Vec::new();
    };
    let device = col("device");

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let id = fields.get(id)?.to_string();
            let dev = device
                .and_then(|d| fields.get(d))
                .map(|d| d.to_string())
                .unwrap_or_else(|| format!("/dev/{}{}", device_prefix, id));
            Some(MappedDevice {
                pool: fields.get(pool)?.to_string(),
                image: fields.get(image)?.to_string(),
                device: dev,
                id,
            })
        })
        .collect()
}
