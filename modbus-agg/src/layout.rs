//! Where each node lives in the shared table.
//!
//! Every region of a node is placed at the node's `offset`. The discrete
//! input region additionally carries the optional coil mirror block right
//! after the node's own discrete inputs, followed by one liveness bit:
//!
//! ```text
//! liveness = offset + discrete_inputs.count + coils.count * mirror_coils
//! ```
//!
//! Table sizes cover these footprints only. A window's remote `start` is a
//! device address and never shifts or grows the table window, which always
//! begins at the node offset.

use std::ops::Range;

use crate::config::NodeConfig;
use crate::table::{Region, RegionSizes};

/// Table-relative ranges claimed by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    pub coils: Range<usize>,
    pub discrete_inputs: Range<usize>,
    pub holding_registers: Range<usize>,
    pub input_registers: Range<usize>,
    /// Discrete inputs holding a copy of the remote coils.
    pub mirror: Option<Range<usize>>,
    /// Discrete input reporting whether the last poll cycle succeeded.
    pub liveness: usize,
}

impl NodeLayout {
    /// Footprint of `node` in the table.
    pub fn of(node: &NodeConfig) -> Self {
        let offset = usize::from(node.offset);
        let span = |count: u16| offset..offset + usize::from(count);

        let discrete_inputs = span(node.discrete_inputs.count);
        let mirror = node.mirror_coils.then(|| {
            let start = discrete_inputs.end;
            start..start + usize::from(node.coils.count)
        });
        let liveness = mirror
            .as_ref()
            .map_or(discrete_inputs.end, |mirror| mirror.end);

        Self {
            coils: span(node.coils.count),
            discrete_inputs,
            holding_registers: span(node.holding_registers.count),
            input_registers: span(node.input_registers.count),
            mirror,
            liveness,
        }
    }

    /// The contiguous range this node owns in `region`.
    ///
    /// For discrete inputs this includes the mirror block and the liveness bit.
    pub fn footprint(&self, region: Region) -> Range<usize> {
        match region {
            Region::Coils => self.coils.clone(),
            Region::DiscreteInputs => self.discrete_inputs.start..self.liveness + 1,
            Region::HoldingRegisters => self.holding_registers.clone(),
            Region::InputRegisters => self.input_registers.clone(),
        }
    }
}

/// Smallest table covering every node's footprint.
pub fn covering_sizes<'a>(layouts: impl IntoIterator<Item = &'a NodeLayout>) -> RegionSizes {
    let mut sizes = RegionSizes::default();
    for layout in layouts {
        for region in Region::ALL {
            let footprint = layout.footprint(region);
            if !footprint.is_empty() {
                sizes.cover(region, footprint.end);
            }
        }
    }
    sizes
}
