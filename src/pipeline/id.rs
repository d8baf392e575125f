//! Identity types for the pipe system.
//!
//! A pipe is addressed by a 64-bit `PipeId` packed from seven fields:
//!
//! ```text
//! bit  0       from network
//! bits 1..=7   source component      (7 bit)
//! bits 8..=14  destination component (7 bit)
//! bit  15      unused
//! bits 16..=23 pipe type             (8 bit)
//! bits 24..=31 object class          (8 bit)
//! bits 32..=47 object type           (16 bit)
//! bits 48..=63 object id             (16 bit)
//! ```
//!
//! `PipeMask` patterns select groups of ids for pipe templates and merger
//! membership. `PipeKey` and `OwnerId` are handle newtypes.

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the seven packed identity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdField {
    FromNetwork,
    SrcId,
    DstId,
    PipeType,
    ObjectClass,
    ObjectType,
    ObjectId,
}

impl IdField {
    pub const ALL: [IdField; 7] = [
        IdField::SrcId,
        IdField::DstId,
        IdField::PipeType,
        IdField::ObjectClass,
        IdField::ObjectType,
        IdField::ObjectId,
        IdField::FromNetwork,
    ];

    #[inline]
    pub const fn shift(self) -> u32 {
        match self {
            IdField::FromNetwork => 0,
            IdField::SrcId => 1,
            IdField::DstId => 8,
            IdField::PipeType => 16,
            IdField::ObjectClass => 24,
            IdField::ObjectType => 32,
            IdField::ObjectId => 48,
        }
    }

    #[inline]
    pub const fn width(self) -> u32 {
        match self {
            IdField::FromNetwork => 1,
            IdField::SrcId | IdField::DstId => 7,
            IdField::PipeType | IdField::ObjectClass => 8,
            IdField::ObjectType | IdField::ObjectId => 16,
        }
    }

    /// Largest value the field can hold.
    #[inline]
    pub const fn max(self) -> u32 {
        (1u32 << self.width()) - 1
    }

    /// The field's bits within a packed id.
    #[inline]
    pub const fn bits(self) -> u64 {
        (self.max() as u64) << self.shift()
    }

    pub fn name(self) -> &'static str {
        match self {
            IdField::FromNetwork => "from_network",
            IdField::SrcId => "src_id",
            IdField::DstId => "dst_id",
            IdField::PipeType => "pipe_type",
            IdField::ObjectClass => "object_class",
            IdField::ObjectType => "object_type",
            IdField::ObjectId => "object_id",
        }
    }
}

/// Unpacked pipe identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PipeIdFields {
    pub src_id: u32,
    pub dst_id: u32,
    pub pipe_type: u32,
    pub object_class: u32,
    pub object_type: u32,
    pub object_id: u32,
    #[serde(default)]
    pub from_network: bool,
}

impl PipeIdFields {
    /// Build and range-check an identity.
    pub fn new(
        src_id: u32,
        dst_id: u32,
        pipe_type: u32,
        object_class: u32,
        object_type: u32,
        object_id: u32,
        from_network: bool,
    ) -> PipelineResult<Self> {
        let fields = Self {
            src_id,
            dst_id,
            pipe_type,
            object_class,
            object_type,
            object_id,
            from_network,
        };
        fields.validate()?;
        Ok(fields)
    }

    pub fn get(&self, field: IdField) -> u32 {
        match field {
            IdField::FromNetwork => self.from_network as u32,
            IdField::SrcId => self.src_id,
            IdField::DstId => self.dst_id,
            IdField::PipeType => self.pipe_type,
            IdField::ObjectClass => self.object_class,
            IdField::ObjectType => self.object_type,
            IdField::ObjectId => self.object_id,
        }
    }

    pub fn set(&mut self, field: IdField, value: u32) {
        match field {
            IdField::FromNetwork => self.from_network = value != 0,
            IdField::SrcId => self.src_id = value,
            IdField::DstId => self.dst_id = value,
            IdField::PipeType => self.pipe_type = value,
            IdField::ObjectClass => self.object_class = value,
            IdField::ObjectType => self.object_type = value,
            IdField::ObjectId => self.object_id = value,
        }
    }

    /// Reject any field that does not fit its bit range.
    pub fn validate(&self) -> PipelineResult<()> {
        for field in IdField::ALL {
            let value = self.get(field);
            if value > field.max() {
                return Err(PipelineError::OutOfRangeIdentityField {
                    field: field.name(),
                    value,
                    max: field.max(),
                });
            }
        }
        Ok(())
    }

    pub fn with_from_network(mut self, from_network: bool) -> Self {
        self.from_network = from_network;
        self
    }

    /// Pack into a `PipeId`. Callers must have validated the fields.
    pub fn pack(&self) -> PipeId {
        PipeId::pack(self)
    }
}

/// Packed 64-bit pipe identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PipeId(pub u64);

impl PipeId {
    /// Pack identity fields. Out-of-range fields are a caller error: they trip
    /// a debug assertion and are truncated in release builds.
    pub fn pack(fields: &PipeIdFields) -> Self {
        debug_assert!(
            fields.validate().is_ok(),
            "identity field out of range: {:?}",
            fields
        );
        let mut id = 0u64;
        for field in IdField::ALL {
            id |= ((fields.get(field) & field.max()) as u64) << field.shift();
        }
        PipeId(id)
    }

    /// Checked variant of `pack`.
    pub fn try_pack(fields: &PipeIdFields) -> PipelineResult<Self> {
        fields.validate()?;
        Ok(Self::pack(fields))
    }

    pub fn unpack(self) -> PipeIdFields {
        let mut fields = PipeIdFields::default();
        for field in IdField::ALL {
            fields.set(field, ((self.0 >> field.shift()) as u32) & field.max());
        }
        fields
    }

    #[inline]
    pub fn from_network(self) -> bool {
        self.0 & 1 != 0
    }

    /// Same id with the network bit forced to `from_network`.
    #[inline]
    pub fn with_from_network(self, from_network: bool) -> Self {
        PipeId((self.0 & !1) | from_network as u64)
    }
}

impl fmt::Debug for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipeId({:#018x})", self.0)
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.unpack();
        write!(
            f,
            "{}->{} type={} class={} objtype={} obj={} {}",
            p.src_id,
            p.dst_id,
            p.pipe_type,
            p.object_class,
            p.object_type,
            p.object_id,
            if p.from_network { "remote" } else { "local" }
        )
    }
}

/// A single field of a `PipeMask`.
///
/// `Any` and `Equal` both match every value. They differ only when a merger
/// resolves its input masks: `Equal` is pinned to the first attached pipe's
/// value, `Any` stays a wildcard forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "PatternRepr", into = "PatternRepr")]
pub enum FieldPattern {
    Value(u32),
    #[default]
    Any,
    Equal,
}

impl FieldPattern {
    #[inline]
    pub fn is_wildcard(self) -> bool {
        !matches!(self, FieldPattern::Value(_))
    }
}

impl From<u32> for FieldPattern {
    fn from(value: u32) -> Self {
        FieldPattern::Value(value)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PatternRepr {
    Value(u32),
    Keyword(Keyword),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Keyword {
    #[serde(alias = "ANY", alias = "Any")]
    Any,
    #[serde(alias = "EQUALS", alias = "equals", alias = "Equal")]
    Equal,
}

impl From<PatternRepr> for FieldPattern {
    fn from(repr: PatternRepr) -> Self {
        match repr {
            PatternRepr::Value(v) => FieldPattern::Value(v),
            PatternRepr::Keyword(Keyword::Any) => FieldPattern::Any,
            PatternRepr::Keyword(Keyword::Equal) => FieldPattern::Equal,
        }
    }
}

impl From<FieldPattern> for PatternRepr {
    fn from(pattern: FieldPattern) -> Self {
        match pattern {
            FieldPattern::Value(v) => PatternRepr::Value(v),
            FieldPattern::Any => PatternRepr::Keyword(Keyword::Any),
            FieldPattern::Equal => PatternRepr::Keyword(Keyword::Equal),
        }
    }
}

/// Per-field pattern over pipe identities. Unset fields default to `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeMask {
    pub src_id: FieldPattern,
    pub dst_id: FieldPattern,
    pub pipe_type: FieldPattern,
    pub object_class: FieldPattern,
    pub object_type: FieldPattern,
    pub object_id: FieldPattern,
    pub from_network: FieldPattern,
}

impl PipeMask {
    /// Mask that matches every pipe.
    pub fn any() -> Self {
        Self::default()
    }

    /// Mask with no wildcards.
    pub fn exact(fields: &PipeIdFields) -> Self {
        let mut mask = Self::default();
        for field in IdField::ALL {
            mask.set(field, FieldPattern::Value(fields.get(field)));
        }
        mask
    }

    pub fn get(&self, field: IdField) -> FieldPattern {
        match field {
            IdField::FromNetwork => self.from_network,
            IdField::SrcId => self.src_id,
            IdField::DstId => self.dst_id,
            IdField::PipeType => self.pipe_type,
            IdField::ObjectClass => self.object_class,
            IdField::ObjectType => self.object_type,
            IdField::ObjectId => self.object_id,
        }
    }

    pub fn set(&mut self, field: IdField, pattern: FieldPattern) {
        match field {
            IdField::FromNetwork => self.from_network = pattern,
            IdField::SrcId => self.src_id = pattern,
            IdField::DstId => self.dst_id = pattern,
            IdField::PipeType => self.pipe_type = pattern,
            IdField::ObjectClass => self.object_class = pattern,
            IdField::ObjectType => self.object_type = pattern,
            IdField::ObjectId => self.object_id = pattern,
        }
    }

    /// Builder-style `set`.
    pub fn with(mut self, field: IdField, pattern: impl Into<FieldPattern>) -> Self {
        self.set(field, pattern.into());
        self
    }

    pub fn validate(&self) -> PipelineResult<()> {
        for field in IdField::ALL {
            if let FieldPattern::Value(value) = self.get(field) {
                if value > field.max() {
                    return Err(PipelineError::OutOfRangeIdentityField {
                        field: field.name(),
                        value,
                        max: field.max(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replace every `Equal` field with the concrete value from `fields`.
    /// `Any` fields are left untouched.
    pub fn resolve_equal(&self, fields: &PipeIdFields) -> PipeMask {
        let mut resolved = *self;
        for field in IdField::ALL {
            if self.get(field) == FieldPattern::Equal {
                resolved.set(field, FieldPattern::Value(fields.get(field)));
            }
        }
        resolved
    }

    pub fn has_equal_fields(&self) -> bool {
        IdField::ALL
            .iter()
            .any(|&f| self.get(f) == FieldPattern::Equal)
    }

    pub fn selector(&self) -> PipeSelector {
        PipeSelector::from_mask(self)
    }

    pub fn matches(&self, id: PipeId) -> bool {
        self.selector().matches(id)
    }
}

/// Compiled `PipeMask`: `matches(id) = (id & care_mask) == test_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeSelector {
    pub care_mask: u64,
    pub test_value: u64,
}

impl PipeSelector {
    /// Wildcard fields (`Any` and `Equal` alike) are zeroed in `test_value`
    /// and cleared from `care_mask`.
    pub fn from_mask(mask: &PipeMask) -> Self {
        let mut care_mask = u64::MAX;
        let mut test_value = 0u64;
        for field in IdField::ALL {
            match mask.get(field) {
                FieldPattern::Value(value) => {
                    debug_assert!(value <= field.max(), "{} out of range", field.name());
                    test_value |= ((value & field.max()) as u64) << field.shift();
                }
                FieldPattern::Any | FieldPattern::Equal => {
                    care_mask &= !field.bits();
                }
            }
        }
        Self {
            care_mask,
            test_value,
        }
    }

    pub fn exact(id: PipeId) -> Self {
        Self {
            care_mask: u64::MAX,
            test_value: id.0,
        }
    }

    #[inline]
    pub fn matches(&self, id: PipeId) -> bool {
        (id.0 & self.care_mask) == self.test_value
    }
}

/// Handle of an open pipe inside a `TransformManager`. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeKey(pub u32);

impl PipeKey {
    pub const INVALID: PipeKey = PipeKey(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for PipeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "PipeKey(INVALID)")
        } else {
            write!(f, "PipeKey({})", self.0)
        }
    }
}

impl fmt::Display for PipeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Id of the session/user owning a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OwnerId(pub u32);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> PipeIdFields {
        PipeIdFields::new(1, 2, 3, 4, 500, 600, false).unwrap()
    }

    #[test]
    fn test_bit_layout() {
        let id = PipeIdFields::new(0x7F, 0, 0, 0, 0, 0, true).unwrap().pack();
        assert_eq!(id.0, 0xFF);

        let id = PipeIdFields::new(0, 0x7F, 0, 0, 0, 0, false).unwrap().pack();
        assert_eq!(id.0, 0x7F00);

        let id = PipeIdFields::new(0, 0, 0, 0, 0, 0xFFFF, false).unwrap().pack();
        assert_eq!(id.0, 0xFFFF_0000_0000_0000);
    }

    #[test]
    fn test_field_bits_do_not_overlap() {
        let mut seen = 0u64;
        for field in IdField::ALL {
            assert_eq!(seen & field.bits(), 0, "{} overlaps", field.name());
            seen |= field.bits();
        }
        // bit 15 is the only unused bit
        assert_eq!(!seen, 1 << 15);
    }

    #[test]
    fn test_out_of_range_field_is_rejected() {
        let err = PipeIdFields::new(0x80, 0, 0, 0, 0, 0, false).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OutOfRangeIdentityField {
                field: "src_id",
                value: 0x80,
                max: 0x7F
            }
        ));
        assert!(PipeIdFields::new(0, 0, 0, 0x100, 0, 0, false).is_err());
        assert!(PipeIdFields::new(0, 0, 0, 0, 0x1_0000, 0, false).is_err());
    }

    #[test]
    fn test_network_bit_helpers() {
        let id = sample().pack();
        assert!(!id.from_network());
        let remote = id.with_from_network(true);
        assert!(remote.from_network());
        assert_eq!(remote.unpack().object_id, 600);
        assert_eq!(remote.with_from_network(false), id);
    }

    #[test]
    fn test_any_and_equal_build_the_same_selector() {
        let any = PipeMask::exact(&sample()).with(IdField::ObjectId, FieldPattern::Any);
        let equal = PipeMask::exact(&sample()).with(IdField::ObjectId, FieldPattern::Equal);
        assert_eq!(any.selector(), equal.selector());
        assert_eq!(any.selector().care_mask & IdField::ObjectId.bits(), 0);
    }

    #[test]
    fn test_wildcard_selector_matches_group() {
        let mask = PipeMask::exact(&sample()).with(IdField::ObjectId, FieldPattern::Any);
        let mut other = sample();
        other.object_id = 7;
        assert!(mask.matches(other.pack()));
        other.object_type = 7;
        assert!(!mask.matches(other.pack()));
    }

    #[test]
    fn test_resolve_equal_pins_only_equal_fields() {
        let mask = PipeMask::any()
            .with(IdField::SrcId, 1)
            .with(IdField::ObjectId, FieldPattern::Equal);
        let resolved = mask.resolve_equal(&sample());
        assert_eq!(resolved.object_id, FieldPattern::Value(600));
        assert_eq!(resolved.object_type, FieldPattern::Any);
        assert!(!resolved.has_equal_fields());
    }

    #[test]
    fn test_field_pattern_serde() {
        let mask: PipeMask =
            serde_json::from_str(r#"{"src_id": 3, "object_id": "equal", "dst_id": "any"}"#)
                .unwrap();
        assert_eq!(mask.src_id, FieldPattern::Value(3));
        assert_eq!(mask.object_id, FieldPattern::Equal);
        assert_eq!(mask.dst_id, FieldPattern::Any);
        assert_eq!(mask.pipe_type, FieldPattern::Any);

        let text = serde_json::to_string(&FieldPattern::Equal).unwrap();
        assert_eq!(text, "\"equal\"");
    }

    #[test]
    fn test_pipe_key() {
        assert!(PipeKey(3).is_valid());
        assert!(!PipeKey::INVALID.is_valid());
    }

    fn arb_fields() -> impl Strategy<Value = PipeIdFields> {
        (
            0u32..=0x7F,
            0u32..=0x7F,
            0u32..=0xFF,
            0u32..=0xFF,
            0u32..=0xFFFF,
            0u32..=0xFFFF,
            any::<bool>(),
        )
            .prop_map(|(s, d, p, c, t, o, n)| PipeIdFields {
                src_id: s,
                dst_id: d,
                pipe_type: p,
                object_class: c,
                object_type: t,
                object_id: o,
                from_network: n,
            })
    }

    proptest! {
        #[test]
        fn test_pack_unpack_round_trip(fields in arb_fields()) {
            prop_assert_eq!(fields.pack().unpack(), fields);
        }

        #[test]
        fn test_exact_mask_rejects_any_single_field_change(
            fields in arb_fields(),
            which in 0usize..7,
            delta in 1u32..0x7F,
        ) {
            let selector = PipeMask::exact(&fields).selector();
            prop_assert!(selector.matches(fields.pack()));

            let field = IdField::ALL[which];
            let mut changed = fields;
            let value = (fields.get(field) + delta) & field.max();
            prop_assume!(value != fields.get(field));
            changed.set(field, value);
            prop_assert!(!selector.matches(changed.pack()));
        }
    }
}
