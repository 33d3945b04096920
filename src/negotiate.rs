//! `Accept-Encoding` negotiation.
//!
//! Negotiation is a pure function of the request header and the immutable
//! [`Config`], so it runs without synchronization on any number of tasks.

use crate::config::{Coding, Config, Prefer};

/// A quality value in thousandths, `0..=1000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quality(u16);

impl Quality {
    /// Explicitly rejected.
    pub const ZERO: Quality = Quality(0);
    /// The implied quality when none is given.
    pub const ONE: Quality = Quality(1000);

    /// Parses a `q` parameter value, returning `None` if it is malformed.
    pub fn parse(s: &str) -> Option<Quality> {
        let value = s.trim().parse::<f32>().ok()?;
        if !(0.0..=1.0).contains(&value) {
            return None;
        }
        Some(Quality((value * 1000.0).round() as u16))
    }

    /// Returns the quality as a fraction.
    pub fn as_f32(self) -> f32 {
        f32::from(self.0) / 1000.0
    }
}

/// One entry of an `Accept-Encoding` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptEntry<'a> {
    /// The coding token as sent, or `*`.
    pub coding: &'a str,
    /// Its quality; malformed values parse as [`Quality::ONE`].
    pub quality: Quality,
}

/// Parses an `Accept-Encoding` value such as `"gzip, br;q=1.0, zstd;q=0.8"`.
///
/// Parsing is lenient: empty entries are skipped and a malformed `q` counts as
/// `1`, so a bad header never fails a request.
pub fn parse_accept_encoding(header: &str) -> Vec<AcceptEntry<'_>> {
    header
        .split(',')
        .filter_map(|part| {
            let mut params = part.split(';');
            let coding = params.next().unwrap_or("").trim();
            if coding.is_empty() {
                return None;
            }

            let quality = params
                .filter_map(|param| param.split_once('='))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("q"))
                .map(|(_, value)| Quality::parse(value).unwrap_or(Quality::ONE))
                .unwrap_or(Quality::ONE);

            Some(AcceptEntry { coding, quality })
        })
        .collect()
}

/// The acceptable codings for one request, best first.
///
/// Empty means the response must not be compressed.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    codings: Vec<Coding>,
}

impl Negotiation {
    /// Returns true when no registered coding is acceptable.
    pub fn is_empty(&self) -> bool {
        self.codings.is_empty()
    }

    /// Returns the best acceptable coding name.
    pub fn preferred(&self) -> Option<&str> {
        self.codings.first().map(Coding::name)
    }

    /// Returns the acceptable coding names, best first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.codings.iter().map(Coding::name)
    }

    pub(crate) fn codings(&self) -> &[Coding] {
        &self.codings
    }
}

/// Intersects the client's `Accept-Encoding` with the registered codings.
///
/// A coding the client does not name takes the quality of `*`, if present.
/// `identity` can never be registered, so it is never a candidate. The result
/// is ordered by [`Config::prefer`], with the coding name as the final
/// tie-break.
pub fn negotiate(config: &Config, accept_encoding: Option<&str>) -> Negotiation {
    let Some(header) = accept_encoding else {
        return Negotiation::default();
    };
    let entries = parse_accept_encoding(header);
    if entries.is_empty() {
        return Negotiation::default();
    }

    // Later duplicates override earlier ones
    let wildcard = entries
        .iter()
        .rev()
        .find(|entry| entry.coding == "*")
        .map(|entry| entry.quality);

    let mut candidates: Vec<(Quality, &Coding)> = config
        .codings()
        .iter()
        .filter_map(|coding| {
            let quality = entries
                .iter()
                .rev()
                .find(|entry| coding.matches(entry.coding))
                .map(|entry| entry.quality)
                .or(wildcard)?;
            (quality > Quality::ZERO).then_some((quality, coding))
        })
        .collect();

    candidates.sort_by(|(qa, a), (qb, b)| {
        let priority = b.priority().cmp(&a.priority());
        let quality = qb.cmp(qa);
        let ordering = match config.prefer() {
            Prefer::Server => priority.then(quality),
            Prefer::Client => quality.then(priority),
        };
        ordering.then_with(|| a.name().cmp(b.name()))
    });

    Negotiation {
        codings: candidates
            .into_iter()
            .map(|(_, coding)| coding.clone())
            .collect(),
    }
}
