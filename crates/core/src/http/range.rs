//! `Range` header parsing and resolution, RFC 7233.

/// One range spec with unresolved endpoints.
///
/// - `(start, Some(end))` with `start >= 0`: closed interval, inclusive.
/// - `(start, None)` with `start >= 0`: from `start` to end of entity.
/// - `(start, None)` with `start < 0`: suffix, last `|start|` bytes.
pub type RangeSpec = (i64, Option<i64>);

/// Parse a `Range` header value.
///
/// Returns `None` for an absent unit, a unit other than `bytes`, or any
/// malformed spec; a single bad spec rejects the whole header.
#[must_use]
pub fn parse_range_header(value: &str) -> Option<Vec<RangeSpec>> {
    let value = value.trim();
    let rest = strip_bytes_unit(value)?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }

    let mut ranges = Vec::new();
    for spec in rest.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        // Exactly one dash separates the endpoints.
        if spec.matches('-').count() != 1 {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => return None,
            (true, false) => {
                // "-500": suffix range.
                let suffix: i64 = end.parse().ok()?;
                if suffix <= 0 {
                    return None;
                }
                ranges.push((-suffix, None));
            }
            (false, true) => {
                // "500-": open ended.
                let start: i64 = start.parse().ok()?;
                if start < 0 {
                    return None;
                }
                ranges.push((start, None));
            }
            (false, false) => {
                let start: i64 = start.parse().ok()?;
                let end: i64 = end.parse().ok()?;
                if start < 0 || end < 0 {
                    return None;
                }
                ranges.push((start, Some(end)));
            }
        }
    }

    if ranges.is_empty() { None } else { Some(ranges) }
}

fn strip_bytes_unit(value: &str) -> Option<&str> {
    let (unit, rest) = value.split_once('=')?;
    if unit.trim().eq_ignore_ascii_case("bytes") {
        Some(rest)
    } else {
        None
    }
}

/// A range spec resolved against an entity size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedRange {
    /// Serve bytes `start..=end`.
    Satisfiable {
        /// First byte offset.
        start: u64,
        /// Last byte offset, inclusive. Always `< size`.
        end: u64,
    },
    /// No byte of the entity satisfies the spec; respond 416.
    Unsatisfiable,
}

/// Resolve one spec against the entity size.
#[must_use]
pub fn resolve_range(spec: RangeSpec, size: u64) -> ResolvedRange {
    let (start, end) = spec;
    if start < 0 {
        // Suffix: last |start| bytes.
        let suffix = start.unsigned_abs().min(size);
        if suffix == 0 || size == 0 {
            return ResolvedRange::Unsatisfiable;
        }
        return ResolvedRange::Satisfiable {
            start: size - suffix,
            end: size - 1,
        };
    }

    let start = start as u64;
    if start >= size {
        return ResolvedRange::Unsatisfiable;
    }
    let end = match end {
        Some(end) => {
            let end = end as u64;
            if end < start {
                return ResolvedRange::Unsatisfiable;
            }
            end.min(size - 1)
        }
        None => size - 1,
    };
    ResolvedRange::Satisfiable { start, end }
}
