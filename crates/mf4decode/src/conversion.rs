//! Conversion rules and the resolver that builds them from `##CC` chains.
//!
//! A channel's conversion is resolved into a numeric [`ConversionRule`] and a
//! [`DisplayRule`] for text labels. Results are memoized per conversion block
//! in a [`ConversionCache`] owned by the document, since many channels tend to
//! share the same few blocks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::blocks::{ConversionDefinition, ConversionOrText, ConversionType, Link};
use crate::error::{Error, Result};

/// Conversion kind the decode engine cannot execute, kept with its
/// parameters so it can be reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsupported {
    pub kind: String,
    pub parameters: Vec<f64>,
}

/// Raw to physical value mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionRule {
    Identity,
    Linear { scale: f64, offset: f64 },
    /// `(a·x² + b·x + c) / (d·x² + e·x + f)`
    Rational3 { a: f64, b: f64, c: f64, d: f64, e: f64, f: f64 },
    Unsupported(Unsupported),
}

impl ConversionRule {
    /// `raw * scale + offset`, canonicalized to [`ConversionRule::Identity`].
    pub fn linear(scale: f64, offset: f64) -> Self {
        if scale == 1.0 && offset == 0.0 {
            ConversionRule::Identity
        } else {
            ConversionRule::Linear { scale, offset }
        }
    }

    /// Rational conversion, reduced to a linear one when the quadratic and
    /// denominator terms are neutral.
    pub fn rational(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        if a == 0.0 && d == 0.0 && e == 0.0 && f == 1.0 {
            Self::linear(b, c)
        } else {
            ConversionRule::Rational3 { a, b, c, d, e, f }
        }
    }

    pub fn unsupported(kind: impl Into<String>, parameters: &[f64]) -> Self {
        ConversionRule::Unsupported(Unsupported {
            kind: kind.into(),
            parameters: parameters.to_vec(),
        })
    }

    /// `(scale, offset)` for rules the buffered fast path can run.
    pub fn as_linear(&self) -> Option<(f64, f64)> {
        match *self {
            ConversionRule::Identity => Some((1.0, 0.0)),
            ConversionRule::Linear { scale, offset } => Some((scale, offset)),
            _ => None,
        }
    }

    /// Converts a single raw value, `None` for unsupported rules.
    pub fn apply(&self, x: f64) -> Option<f64> {
        match *self {
            ConversionRule::Identity => Some(x),
            ConversionRule::Linear { scale, offset } => Some(x * scale + offset),
            ConversionRule::Rational3 { a, b, c, d, e, f } => {
                Some((a * x * x + b * x + c) / (d * x * x + e * x + f))
            }
            ConversionRule::Unsupported(_) => None,
        }
    }

    /// The rule computing `self(inner(x))`.
    ///
    /// Only identity and linear pairs fold into a single rule; anything else
    /// is unsupported.
    pub fn after(self, inner: ConversionRule) -> ConversionRule {
        match (self, inner) {
            (outer, ConversionRule::Identity) => outer,
            (ConversionRule::Identity, inner) => inner,
            (_, unsupported @ ConversionRule::Unsupported(_)) => unsupported,
            (unsupported @ ConversionRule::Unsupported(_), _) => unsupported,
            (
                ConversionRule::Linear { scale, offset },
                ConversionRule::Linear { scale: inner_scale, offset: inner_offset },
            ) => ConversionRule::linear(scale * inner_scale, scale * inner_offset + offset),
            (outer, inner) => {
                let mut parameters = outer.parameters();
                parameters.extend(inner.parameters());
                ConversionRule::unsupported("chained conversion", &parameters)
            }
        }
    }

    fn parameters(&self) -> Vec<f64> {
        match *self {
            ConversionRule::Identity => Vec::new(),
            ConversionRule::Linear { scale, offset } => vec![offset, scale],
            ConversionRule::Rational3 { a, b, c, d, e, f } => vec![a, b, c, d, e, f],
            ConversionRule::Unsupported(ref u) => u.parameters.clone(),
        }
    }
}

impl fmt::Display for ConversionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionRule::Identity => write!(f, "x"),
            ConversionRule::Linear { scale, offset } => write!(f, "(x * {} + {})", scale, offset),
            ConversionRule::Rational3 { a, b, c, d, e, f: f_ } => write!(
                f,
                "(x * x * {} + x * {} + {}) / (x * x * {} + x * {} + {})",
                a, b, c, d, e, f_
            ),
            ConversionRule::Unsupported(u) => write!(f, "unsupported({})", u.kind),
        }
    }
}

/// Discrete raw values mapped onto text labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupTable {
    entries: Vec<(f64, String)>,
    default: Option<String>,
}

impl LookupTable {
    /// Later entries for the same key replace earlier ones.
    pub fn insert(&mut self, key: f64, text: impl Into<String>) {
        let text = text.into();
        match self.entries.binary_search_by(|(k, _)| k.total_cmp(&key)) {
            Ok(i) => self.entries[i].1 = text,
            Err(i) => self.entries.insert(i, (key, text)),
        }
    }

    pub fn set_default(&mut self, text: impl Into<String>) {
        self.default = Some(text.into());
    }

    pub fn get(&self, raw: f64) -> Option<&str> {
        self.entries
            .binary_search_by(|(k, _)| k.total_cmp(&raw))
            .ok()
            .map(|i| self.entries[i].1.as_str())
            .or(self.default.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Text shown for a raw value, independent of its numeric conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DisplayRule {
    #[default]
    None,
    Lookup(LookupTable),
}

impl DisplayRule {
    pub fn label(&self, raw: f64) -> Option<&str> {
        match self {
            DisplayRule::None => None,
            DisplayRule::Lookup(table) => table.get(raw),
        }
    }
}

pub type ResolvedConversion = (ConversionRule, DisplayRule);

/// Resolved conversions of one document, keyed by conversion block address.
///
/// Lookups and inserts each take the lock briefly. Two threads missing on the
/// same block both compute it and the last insert wins; the results are equal.
///
/// Once closed the cache stays empty: channels that outlive their document
/// still resolve, but nothing is stored.
#[derive(Debug, Default)]
pub struct ConversionCache {
    entries: Mutex<HashMap<Link<ConversionDefinition>, ResolvedConversion>>,
    computed: AtomicUsize,
    closed: AtomicBool,
}

impl ConversionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, link: Link<ConversionDefinition>) -> Option<ResolvedConversion> {
        self.entries.lock().get(&link).cloned()
    }

    pub fn insert(&self, link: Link<ConversionDefinition>, resolved: ResolvedConversion) {
        let mut entries = self.entries.lock();
        if !self.is_closed() {
            entries.insert(link, resolved);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of conversion blocks resolved from scratch so far.
    pub fn computed(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Clears the cache and stops it from taking new entries.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Turns `##CC` chains into [`ConversionRule`]/[`DisplayRule`] pairs.
#[derive(Debug, Clone, Default)]
pub struct ConversionResolver {
    cache: Arc<ConversionCache>,
}

impl ConversionResolver {
    pub fn new(cache: Arc<ConversionCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ConversionCache> {
        &self.cache
    }

    /// Resolves a channel's conversion. No conversion block means identity.
    ///
    /// Conversion kinds the engine cannot execute are reported as
    /// [`Error::UnsupportedConversion`], never as a fallback rule.
    pub fn resolve(&self, definition: Option<&ConversionDefinition>) -> Result<ResolvedConversion> {
        let Some(definition) = definition else {
            return Ok((ConversionRule::Identity, DisplayRule::None));
        };

        let (rule, display) = self.resolve_definition(definition)?;
        if let ConversionRule::Unsupported(unsupported) = &rule {
            warn!(
                link = %definition.link,
                kind = %unsupported.kind,
                "conversion not supported, please report with a sample file"
            );
            return Err(Error::unsupported(unsupported.kind.clone(), &unsupported.parameters));
        }
        Ok((rule, display))
    }

    fn resolve_definition(&self, c: &ConversionDefinition) -> Result<ResolvedConversion> {
        if let Some(resolved) = self.cache.get(c.link) {
            debug!(link = %c.link, "conversion cache hit");
            return Ok(resolved);
        }

        // References beyond the parameters point at a conversion applied
        // before this one. Only the last one is followed.
        let mut resolved = (ConversionRule::Identity, DisplayRule::None);
        if !c.refs.is_empty() && c.refs.len() != c.values.len() {
            if let Some(Some(ConversionOrText::Conversion(chained))) = c.refs.last() {
                resolved = self.resolve_definition(chained)?;
            }
        }

        let resolved = self.dispatch(c, resolved)?;
        self.cache.computed.fetch_add(1, Ordering::Relaxed);
        debug!(link = %c.link, kind = ?c.conversion_type, rule = %resolved.0, "conversion resolved");
        self.cache.insert(c.link, resolved.clone());
        Ok(resolved)
    }

    fn dispatch(&self, c: &ConversionDefinition, chained: ResolvedConversion) -> Result<ResolvedConversion> {
        let p = &c.values;
        let (rule, display) = chained;

        let resolved = match c.conversion_type {
            ConversionType::OneToOne => {
                expect_values(c, 0)?;
                (rule, display)
            }
            ConversionType::Linear => {
                expect_values(c, 2)?;
                (ConversionRule::linear(p[1], p[0]).after(rule), display)
            }
            ConversionType::Rational => {
                expect_values(c, 6)?;
                (ConversionRule::rational(p[0], p[1], p[2], p[3], p[4], p[5]).after(rule), display)
            }
            ConversionType::ValueToValueTableWithInterpolation => {
                if p.len() % 2 != 0 {
                    return Err(Error::malformed(c.link, "odd number of table values"));
                }
                let is_identity = !p.is_empty() && p.chunks(2).all(|row| row[0] == row[1]);
                if is_identity {
                    (rule, display)
                } else {
                    (ConversionRule::unsupported("value to value table with interpolation", p), display)
                }
            }
            ConversionType::ValueToTextOrScale => {
                if c.refs.len() < p.len() {
                    return Err(Error::malformed(
                        c.link,
                        format!("{} keys but {} references", p.len(), c.refs.len()),
                    ));
                }
                self.lookup(c, p.iter().copied(), rule)?
            }
            ConversionType::ValueRangeToTextOrScale => {
                let rows = p.len() / 2;
                if p.len() % 2 != 0 || c.refs.len() < rows {
                    return Err(Error::malformed(
                        c.link,
                        format!("{} range values but {} references", p.len(), c.refs.len()),
                    ));
                }
                if p.chunks(2).any(|range| range[0] != range[1]) {
                    (ConversionRule::unsupported("ranged value to text", p), DisplayRule::None)
                } else {
                    self.lookup(c, p.chunks(2).map(|range| range[0]), rule)?
                }
            }
            kind @ (ConversionType::Algebraic
            | ConversionType::ValueToValueTableWithoutInterpolation
            | ConversionType::ValueRangeToValueTable
            | ConversionType::TextToValue
            | ConversionType::TextToText
            | ConversionType::BitfieldText) => {
                (ConversionRule::unsupported(format!("{kind:?}"), p), display)
            }
        };
        Ok(resolved)
    }

    /// Builds the text table of a value-to-text block. A single conversion
    /// among the key references supplies the numeric rule.
    fn lookup(
        &self,
        c: &ConversionDefinition,
        keys: impl ExactSizeIterator<Item = f64>,
        rule: ConversionRule,
    ) -> Result<ResolvedConversion> {
        let rows = keys.len();
        let key_refs = &c.refs[..rows];

        let conversions: Vec<&ConversionDefinition> = key_refs
            .iter()
            .filter_map(|r| match r {
                Some(ConversionOrText::Conversion(definition)) => Some(definition.as_ref()),
                _ => None,
            })
            .collect();

        let rule = match conversions.as_slice() {
            [] => rule,
            [single] => self.resolve_definition(single)?.0,
            _ => {
                return Ok((
                    ConversionRule::unsupported("multiple chained conversions", &c.values),
                    DisplayRule::None,
                ))
            }
        };

        let mut table = LookupTable::default();
        for (key, reference) in keys.zip(key_refs) {
            if let Some(ConversionOrText::Text(text)) = reference {
                table.insert(key, text.as_str());
            }
        }
        if let Some(Some(ConversionOrText::Text(default))) = c.refs.get(rows) {
            table.set_default(default.as_str());
        }

        Ok((rule, DisplayRule::Lookup(table)))
    }
}

fn expect_values(c: &ConversionDefinition, count: usize) -> Result<()> {
    if c.values.len() != count {
        return Err(Error::malformed(
            c.link,
            format!("expected {} conversion parameters, found {}", count, c.values.len()),
        ));
    }
    Ok(())
}
