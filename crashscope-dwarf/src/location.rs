//! Location descriptions and PC-based resolution
//!
//! A location attribute (`DW_AT_location`, `DW_AT_frame_base`, ...) is
//! either a bare expression block, valid everywhere, or a location list of
//! `(low, high, expression)` ranges keyed by PC. Ranges are CU-relative:
//! an entry applies when `cu_low + low <= pc < cu_low + high`. The bare
//! block is modeled as the single unbounded range `(0, u64::MAX)`.

use tracing::{debug, warn};

use crate::attrs::{Dwarf, Unit};
use crate::core::{EvalContext, EvalError, EvalErrorKind, Location, Result};
use crate::expr::DwarfExpression;
use crate::loader::Reader;

/// One PC range of a location list.
#[derive(Debug, Clone)]
pub struct LocationRange {
    pub low: u64,
    pub high: u64,
    pub expr: DwarfExpression,
}

impl LocationRange {
    /// The `(0, MAX)` range of a bare expression block.
    pub fn unbounded(expr: DwarfExpression) -> Self {
        Self {
            low: 0,
            high: u64::MAX,
            expr,
        }
    }

    fn is_unbounded(&self) -> bool {
        self.low == 0 && self.high == u64::MAX
    }
}

/// A loaded location description.
#[derive(Debug, Clone, Default)]
pub struct DwarfLocation {
    ranges: Vec<LocationRange>,
}

impl DwarfLocation {
    pub fn from_ranges(ranges: Vec<LocationRange>) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &[LocationRange] {
        &self.ranges
    }

    /// Load a location description from an attribute value.
    ///
    /// `cu_low` rebases the absolute entry forms of DWARF 5 location lists
    /// into the CU-relative model; `address_size` sizes `DW_OP_addr`
    /// operands.
    pub fn from_attr(
        dwarf: &Dwarf,
        unit: &Unit,
        value: gimli::AttributeValue<Reader>,
        cu_low: u64,
        address_size: u8,
    ) -> Result<Option<Self>> {
        match value {
            // Simple location expression: one unbounded range.
            gimli::AttributeValue::Exprloc(expression) => {
                let expr = DwarfExpression::parse(expression.0.slice(), address_size)?;
                Ok(Some(Self::from_ranges(vec![LocationRange::unbounded(
                    expr,
                )])))
            }
            gimli::AttributeValue::Block(block) => {
                let expr = DwarfExpression::parse(block.slice(), address_size)?;
                Ok(Some(Self::from_ranges(vec![LocationRange::unbounded(
                    expr,
                )])))
            }
            // Location list forms.
            gimli::AttributeValue::LocationListsRef(offset) => {
                Self::from_loclist(dwarf, unit, offset, cu_low, address_size).map(Some)
            }
            gimli::AttributeValue::SecOffset(offset) => Self::from_loclist(
                dwarf,
                unit,
                gimli::LocationListsOffset(offset as usize),
                cu_low,
                address_size,
            )
            .map(Some),
            other => {
                warn!("unsupported location attribute form: {:?}", other);
                Ok(None)
            }
        }
    }

    fn from_loclist(
        dwarf: &Dwarf,
        unit: &Unit,
        offset: gimli::LocationListsOffset<usize>,
        cu_low: u64,
        address_size: u8,
    ) -> Result<Self> {
        let mut ranges = Vec::new();
        let mut raw = dwarf.raw_locations(unit, offset)?;

        while let Some(entry) = raw.next()? {
            use gimli::read::RawLocListEntry;
            let (low, high, data) = match entry {
                RawLocListEntry::AddressOrOffsetPair { begin, end, data }
                | RawLocListEntry::OffsetPair { begin, end, data } => (begin, end, data),
                RawLocListEntry::DefaultLocation { data } => (0, u64::MAX, data),
                RawLocListEntry::StartEnd { begin, end, data } => {
                    (begin.wrapping_sub(cu_low), end.wrapping_sub(cu_low), data)
                }
                RawLocListEntry::StartLength {
                    begin,
                    length,
                    data,
                } => {
                    let begin = begin.wrapping_sub(cu_low);
                    (begin, begin + length, data)
                }
                RawLocListEntry::StartxEndx { begin, end, data } => {
                    let begin = dwarf.address(unit, begin)?.wrapping_sub(cu_low);
                    let end = dwarf.address(unit, end)?.wrapping_sub(cu_low);
                    (begin, end, data)
                }
                RawLocListEntry::StartxLength {
                    begin,
                    length,
                    data,
                } => {
                    let begin = dwarf.address(unit, begin)?.wrapping_sub(cu_low);
                    (begin, begin + length, data)
                }
                // Base-address selection entries do not occur in the
                // single-CU lists this tool consumes.
                RawLocListEntry::BaseAddress { .. } | RawLocListEntry::BaseAddressx { .. } => {
                    debug!("ignoring base-address selection entry in location list");
                    continue;
                }
            };
            let expr = DwarfExpression::parse(data.0.slice(), address_size)?;
            ranges.push(LocationRange { low, high, expr });
        }

        debug!("location list with {} ranges", ranges.len());
        Ok(Self::from_ranges(ranges))
    }

    /// Pick and evaluate the expression active at `pc`.
    pub fn resolve(&self, context: &EvalContext<'_>, pc: u64) -> std::result::Result<Location, EvalError> {
        self.resolve_with_depth(context, pc, 0)
    }

    pub(crate) fn resolve_with_depth(
        &self,
        context: &EvalContext<'_>,
        pc: u64,
        depth: usize,
    ) -> std::result::Result<Location, EvalError> {
        // A lone unbounded entry applies regardless of PC.
        if self.ranges.len() == 1 && self.ranges[0].is_unbounded() {
            let mut stack = Vec::new();
            return self.ranges[0]
                .expr
                .evaluate_with_depth(context, pc, &mut stack, depth);
        }

        // First matching range wins; both endpoints are CU-rebased.
        for range in &self.ranges {
            let low = context.cu_low.wrapping_add(range.low);
            let high = context.cu_low.wrapping_add(range.high);
            if pc >= low && pc < high {
                let mut stack = Vec::new();
                return range.expr.evaluate_with_depth(context, pc, &mut stack, depth);
            }
        }

        Err(EvalError::new(EvalErrorKind::AddressInvalid, pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::DwarfOp;

    const OP_CONST1U: u8 = 0x08;
    const OP_LIT0: u8 = 0x30;

    fn const_expr(value: u64) -> DwarfExpression {
        DwarfExpression::from_ops(vec![DwarfOp {
            opcode: OP_CONST1U,
            op1: value,
            offset: 0,
            ..Default::default()
        }])
    }

    #[test]
    fn single_unbounded_entry_matches_any_pc() {
        let loc = DwarfLocation::from_ranges(vec![LocationRange::unbounded(const_expr(0x33))]);
        let ctx = EvalContext::default();
        assert_eq!(loc.resolve(&ctx, 0).unwrap(), Location::Address(0x33));
        assert_eq!(
            loc.resolve(&ctx, u64::MAX - 1).unwrap(),
            Location::Address(0x33)
        );
    }

    #[test]
    fn first_matching_range_is_selected() {
        let loc = DwarfLocation::from_ranges(vec![
            LocationRange {
                low: 0x100,
                high: 0x200,
                expr: const_expr(0x11),
            },
            LocationRange {
                low: 0x200,
                high: 0x300,
                expr: const_expr(0x22),
            },
        ]);
        let ctx = EvalContext::default();

        // pc 0x250 selects the second entry only.
        assert_eq!(loc.resolve(&ctx, 0x250).unwrap(), Location::Address(0x22));
        assert_eq!(loc.resolve(&ctx, 0x100).unwrap(), Location::Address(0x11));
        // high end is exclusive.
        assert_eq!(loc.resolve(&ctx, 0x1ff).unwrap(), Location::Address(0x11));
        assert_eq!(loc.resolve(&ctx, 0x200).unwrap(), Location::Address(0x22));
    }

    #[test]
    fn overlapping_ranges_resolve_to_the_first() {
        // Lists are non-overlapping in well-formed debug info; when they
        // are not, order decides.
        let loc = DwarfLocation::from_ranges(vec![
            LocationRange {
                low: 0x100,
                high: 0x300,
                expr: const_expr(0x11),
            },
            LocationRange {
                low: 0x200,
                high: 0x400,
                expr: const_expr(0x22),
            },
        ]);
        let ctx = EvalContext::default();
        assert_eq!(loc.resolve(&ctx, 0x250).unwrap(), Location::Address(0x11));
        assert_eq!(loc.resolve(&ctx, 0x350).unwrap(), Location::Address(0x22));
    }

    #[test]
    fn frame_base_may_itself_be_a_value() {
        // A frame base that terminates in a Value still anchors fbreg.
        const OP_STACK_VALUE: u8 = 0x9f;
        const OP_FBREG: u8 = 0x91;
        let frame_base = DwarfLocation::from_ranges(vec![LocationRange::unbounded(
            DwarfExpression::from_ops(vec![
                DwarfOp {
                    opcode: OP_CONST1U,
                    op1: 0x80,
                    offset: 0,
                    ..Default::default()
                },
                DwarfOp {
                    opcode: OP_STACK_VALUE,
                    offset: 2,
                    ..Default::default()
                },
            ]),
        )]);
        let ctx = EvalContext {
            frame_base: Some(&frame_base),
            ..Default::default()
        };
        let var = DwarfLocation::from_ranges(vec![LocationRange::unbounded(
            DwarfExpression::from_ops(vec![DwarfOp {
                opcode: OP_FBREG,
                op1: 0x10,
                offset: 0,
                ..Default::default()
            }]),
        )]);
        assert_eq!(var.resolve(&ctx, 0).unwrap(), Location::Address(0x90));
    }

    #[test]
    fn ranges_are_cu_relative() {
        let loc = DwarfLocation::from_ranges(vec![LocationRange {
            low: 0x10,
            high: 0x20,
            expr: const_expr(0x44),
        }]);
        let ctx = EvalContext {
            cu_low: 0x40_0000,
            ..Default::default()
        };

        assert_eq!(
            loc.resolve(&ctx, 0x40_0010).unwrap(),
            Location::Address(0x44)
        );
        // The raw (non-rebased) PC does not match.
        let err = loc.resolve(&ctx, 0x10).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::AddressInvalid);
    }

    #[test]
    fn no_match_reports_the_pc() {
        let loc = DwarfLocation::from_ranges(vec![LocationRange {
            low: 0x100,
            high: 0x200,
            expr: const_expr(0x11),
        }]);
        let err = loc.resolve(&EvalContext::default(), 0x999).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::AddressInvalid);
        assert_eq!(err.offset, 0x999);
    }

    #[test]
    fn empty_list_never_matches() {
        let loc = DwarfLocation::default();
        let err = loc.resolve(&EvalContext::default(), 0x100).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::AddressInvalid);
    }

    #[test]
    fn fbreg_resolves_through_frame_base() {
        // frame base = lit0-style constant list; variable at fbreg+8.
        let frame_base =
            DwarfLocation::from_ranges(vec![LocationRange::unbounded(const_expr(0x7000))]);
        let ctx = EvalContext {
            frame_base: Some(&frame_base),
            ..Default::default()
        };

        const OP_FBREG: u8 = 0x91;
        let var = DwarfLocation::from_ranges(vec![LocationRange::unbounded(
            DwarfExpression::from_ops(vec![DwarfOp {
                opcode: OP_FBREG,
                op1: 8,
                offset: 0,
                ..Default::default()
            }]),
        )]);
        assert_eq!(var.resolve(&ctx, 0).unwrap(), Location::Address(0x7008));
    }

    #[test]
    fn self_referential_frame_base_is_cut_off() {
        // A frame base whose expression is itself fbreg: the depth cap
        // turns the cycle into FrameBaseInvalid instead of a stack blowup.
        const OP_FBREG: u8 = 0x91;
        let cyclic = DwarfLocation::from_ranges(vec![LocationRange::unbounded(
            DwarfExpression::from_ops(vec![DwarfOp {
                opcode: OP_FBREG,
                op1: 0,
                offset: 0,
                ..Default::default()
            }]),
        )]);
        let ctx = EvalContext {
            frame_base: Some(&cyclic),
            ..Default::default()
        };
        let err = cyclic.resolve(&ctx, 0).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::FrameBaseInvalid);
    }

    #[test]
    fn lit_expression_through_resolution() {
        let loc = DwarfLocation::from_ranges(vec![LocationRange::unbounded(
            DwarfExpression::from_ops(vec![DwarfOp {
                opcode: OP_LIT0 + 5,
                offset: 0,
                ..Default::default()
            }]),
        )]);
        assert_eq!(
            loc.resolve(&EvalContext::default(), 0).unwrap(),
            Location::Address(5)
        );
    }
}
