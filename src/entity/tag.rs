//! Column tag grammar.
//!
//! ```text
//! tag        = name [ "," kind-part ] [ "," options ]
//! kind-part  = kind [ "+conflict" ]
//! kind       = "pk" | "incrpk" | "acb" | "act" | "amb" | "amt"
//!            | "adb" | "adt" | "aol" | "json" | "vc"
//!            | "ref" | "link" | "links" | "tree" | "normal"
//! ```
//!
//! Options are kept verbatim after the second comma, so a `vc` fragment may
//! itself contain commas.

use super::column::ColumnKind;
use crate::condition::{Direction, Order, Orders, Range};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref IDENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap();
    static ref RANGE: Regex = Regex::new(r"^(\d+)\s*:\s*(\d+)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub kind: ColumnKind,
    pub conflict: bool,
    pub options: String,
}

/// `host+target` pair of a relation tag, plus the ordering and window of
/// `links`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationOptions {
    pub host: String,
    pub target: String,
    pub orders: Orders,
    pub range: Option<Range>,
}

pub fn is_identifier(name: &str) -> bool {
    IDENT.is_match(name)
}

pub fn parse(tag: &str) -> Result<Tag, String> {
    let mut parts = tag.splitn(3, ',');
    let name = parts.next().unwrap_or_default().trim().to_string();
    if !is_identifier(&name) {
        return Err(format!("invalid column name '{}'", name));
    }

    let kind_part = parts.next().map(str::trim).unwrap_or_default();
    let (kind_text, conflict) = match kind_part.strip_suffix("+conflict") {
        Some(kind) => (kind.trim(), true),
        None => (kind_part, false),
    };
    let kind = if kind_text.is_empty() {
        ColumnKind::Normal
    } else {
        ColumnKind::parse(kind_text).ok_or_else(|| format!("unknown column kind '{}'", kind_text))?
    };
    if conflict && kind != ColumnKind::Normal && kind != ColumnKind::Pk {
        return Err(format!("kind '{}' cannot be a conflict column", kind));
    }

    let options = parts.next().map(str::trim).unwrap_or_default().to_string();
    if kind == ColumnKind::Virtual && options.is_empty() {
        return Err(format!("virtual column '{}' needs a sql fragment", name));
    }
    if kind.is_relation() && options.is_empty() {
        return Err(format!("{} column '{}' needs host+target columns", kind, name));
    }

    Ok(Tag {
        name,
        kind,
        conflict,
        options,
    })
}

/// Parses `host+target[,field [ASC|DESC]]*[,offset:length]`. Ordering and the
/// window are only accepted for `links`.
pub fn parse_relation(kind: ColumnKind, options: &str) -> Result<RelationOptions, String> {
    let mut segments = options.split(',').map(str::trim);
    let pair = segments.next().unwrap_or_default();
    let (host, target) = pair
        .split_once('+')
        .map(|(h, t)| (h.trim(), t.trim()))
        .ok_or_else(|| format!("expected host+target, got '{}'", pair))?;
    if !is_identifier(host) || !is_identifier(target) {
        return Err(format!("invalid relation columns '{}'", pair));
    }

    let mut orders = Orders::new();
    let mut range = None;
    for segment in segments.filter(|s| !s.is_empty()) {
        if kind != ColumnKind::Links {
            return Err(format!("{} options accept no '{}'", kind, segment));
        }
        if let Some(caps) = RANGE.captures(segment) {
            if range.is_some() {
                return Err("more than one offset:length".to_string());
            }
            let offset: u64 = caps[1].parse().map_err(|_| format!("bad offset in '{}'", segment))?;
            let length: u64 = caps[2].parse().map_err(|_| format!("bad length in '{}'", segment))?;
            range = Some(Range::new(offset, length).map_err(|err| err.to_string())?);
            continue;
        }

        let mut words = segment.split_whitespace();
        let field = words.next().unwrap_or_default();
        let direction = match words.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => Direction::Asc,
            Some("DESC") => Direction::Desc,
            Some(other) => return Err(format!("unknown direction '{}'", other)),
        };
        if words.next().is_some() || !is_identifier(field) {
            return Err(format!("invalid order '{}'", segment));
        }
        orders.push(Order::new(field, direction));
    }

    Ok(RelationOptions {
        host: host.to_string(),
        target: target.to_string(),
        orders,
        range,
    })
}
