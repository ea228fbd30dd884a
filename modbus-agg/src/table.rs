//! The shared Modbus address space.
//!
//! One table per register type, allocated once at startup and shared by
//! every node poller and the Modbus server. All access goes through a
//! single table-wide `RwLock`; callers never hold it across network I/O.

use parking_lot::RwLock;
use thiserror::Error;

/// Number of addressable entries in a 16-bit Modbus region.
pub const MAX_REGION_SIZE: usize = 1 << 16;

/// Modbus register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Read/write, 1-bit
    Coils,
    /// Read-only, 1-bit
    DiscreteInputs,
    /// Read/write, 16-bit
    HoldingRegisters,
    /// Read-only, 16-bit
    InputRegisters,
}

impl Region {
    /// Every region, for iteration.
    pub const ALL: [Region; 4] = [
        Region::Coils,
        Region::DiscreteInputs,
        Region::HoldingRegisters,
        Region::InputRegisters,
    ];

    /// Return the string name for this region.
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Coils => "coils",
            Region::DiscreteInputs => "discrete_inputs",
            Region::HoldingRegisters => "holding_registers",
            Region::InputRegisters => "input_registers",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two single-bit regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitRegion {
    Coils,
    DiscreteInputs,
}

impl From<BitRegion> for Region {
    fn from(region: BitRegion) -> Self {
        match region {
            BitRegion::Coils => Region::Coils,
            BitRegion::DiscreteInputs => Region::DiscreteInputs,
        }
    }
}

/// The two 16-bit regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordRegion {
    HoldingRegisters,
    InputRegisters,
}

impl From<WordRegion> for Region {
    fn from(region: WordRegion) -> Self {
        match region {
            WordRegion::HoldingRegisters => Region::HoldingRegisters,
            WordRegion::InputRegisters => Region::InputRegisters,
        }
    }
}

/// Number of entries in each region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSizes {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl RegionSizes {
    pub fn get(&self, region: Region) -> usize {
        match region {
            Region::Coils => self.coils,
            Region::DiscreteInputs => self.discrete_inputs,
            Region::HoldingRegisters => self.holding_registers,
            Region::InputRegisters => self.input_registers,
        }
    }

    /// Grow `region` so that it covers at least `end` entries.
    pub fn cover(&mut self, region: Region, end: usize) {
        let size = match region {
            Region::Coils => &mut self.coils,
            Region::DiscreteInputs => &mut self.discrete_inputs,
            Region::HoldingRegisters => &mut self.holding_registers,
            Region::InputRegisters => &mut self.input_registers,
        };
        *size = (*size).max(end);
    }
}

/// The table could not be allocated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("{region} table of {size} entries exceeds the 16-bit address space")]
    TooLarge { region: Region, size: usize },
}

/// A request touched addresses outside the allocated table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("{region} request for {count} entries at {address} exceeds table size {size}")]
    OutOfRange {
        region: Region,
        address: usize,
        count: usize,
        size: usize,
    },
}

/// A bounds-checked slice of a bit region.
///
/// Only [`AddressSpace::bit_window`] creates these, so holding one proves
/// the range fits the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitWindow {
    region: BitRegion,
    start: usize,
    len: usize,
}

impl BitWindow {
    pub fn region(&self) -> BitRegion {
        self.region
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A bounds-checked slice of a word region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordWindow {
    region: WordRegion,
    start: usize,
    len: usize,
}

impl WordWindow {
    pub fn region(&self) -> WordRegion {
        self.region
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The four region tables, as seen while holding the lock.
#[derive(Debug)]
pub struct Tables {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

impl Tables {
    fn bit_table(&self, region: BitRegion) -> &[bool] {
        match region {
            BitRegion::Coils => &self.coils,
            BitRegion::DiscreteInputs => &self.discrete_inputs,
        }
    }

    fn bit_table_mut(&mut self, region: BitRegion) -> &mut [bool] {
        match region {
            BitRegion::Coils => &mut self.coils,
            BitRegion::DiscreteInputs => &mut self.discrete_inputs,
        }
    }

    fn word_table(&self, region: WordRegion) -> &[u16] {
        match region {
            WordRegion::HoldingRegisters => &self.holding_registers,
            WordRegion::InputRegisters => &self.input_registers,
        }
    }

    fn word_table_mut(&mut self, region: WordRegion) -> &mut [u16] {
        match region {
            WordRegion::HoldingRegisters => &mut self.holding_registers,
            WordRegion::InputRegisters => &mut self.input_registers,
        }
    }

    pub fn bits(&self, window: &BitWindow) -> &[bool] {
        &self.bit_table(window.region)[window.start..window.start + window.len]
    }

    pub fn bits_mut(&mut self, window: &BitWindow) -> &mut [bool] {
        &mut self.bit_table_mut(window.region)[window.start..window.start + window.len]
    }

    pub fn words(&self, window: &WordWindow) -> &[u16] {
        &self.word_table(window.region)[window.start..window.start + window.len]
    }

    pub fn words_mut(&mut self, window: &WordWindow) -> &mut [u16] {
        &mut self.word_table_mut(window.region)[window.start..window.start + window.len]
    }
}

/// The process-wide table shared by pollers and the server.
#[derive(Debug)]
pub struct AddressSpace {
    sizes: RegionSizes,
    tables: RwLock<Tables>,
}

impl AddressSpace {
    /// Allocate zero-filled tables of the given sizes.
    pub fn allocate(sizes: RegionSizes) -> Result<Self, AllocationError> {
        for region in Region::ALL {
            let size = sizes.get(region);
            if size > MAX_REGION_SIZE {
                return Err(AllocationError::TooLarge { region, size });
            }
        }

        let tables = Tables {
            coils: vec![false; sizes.coils],
            discrete_inputs: vec![false; sizes.discrete_inputs],
            holding_registers: vec![0; sizes.holding_registers],
            input_registers: vec![0; sizes.input_registers],
        };

        Ok(Self {
            sizes,
            tables: RwLock::new(tables),
        })
    }

    pub fn sizes(&self) -> RegionSizes {
        self.sizes
    }

    fn check(&self, region: Region, start: usize, len: usize) -> Result<(), AddressError> {
        let size = self.sizes.get(region);
        if start + len > size {
            return Err(AddressError::OutOfRange {
                region,
                address: start,
                count: len,
                size,
            });
        }
        Ok(())
    }

    /// Validate a bit range once and hand back a window for it.
    pub fn bit_window(
        &self,
        region: BitRegion,
        start: usize,
        len: usize,
    ) -> Result<BitWindow, AddressError> {
        self.check(region.into(), start, len)?;
        Ok(BitWindow { region, start, len })
    }

    /// Validate a word range once and hand back a window for it.
    pub fn word_window(
        &self,
        region: WordRegion,
        start: usize,
        len: usize,
    ) -> Result<WordWindow, AddressError> {
        self.check(region.into(), start, len)?;
        Ok(WordWindow { region, start, len })
    }

    /// Run `f` against a consistent snapshot under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    /// Run a compare-then-write sequence under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.tables.write())
    }

    /// Read `count` bits starting at protocol address `address`.
    pub fn read_bits(
        &self,
        region: BitRegion,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, AddressError> {
        let window = self.bit_window(region, address.into(), count.into())?;
        Ok(self.read(|t| t.bits(&window).to_vec()))
    }

    /// Write `values` starting at protocol address `address`.
    pub fn write_bits(
        &self,
        region: BitRegion,
        address: u16,
        values: &[bool],
    ) -> Result<(), AddressError> {
        let window = self.bit_window(region, address.into(), values.len())?;
        self.update(|t| t.bits_mut(&window).copy_from_slice(values));
        Ok(())
    }

    /// Read `count` words starting at protocol address `address`.
    pub fn read_words(
        &self,
        region: WordRegion,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, AddressError> {
        let window = self.word_window(region, address.into(), count.into())?;
        Ok(self.read(|t| t.words(&window).to_vec()))
    }

    /// Write `values` starting at protocol address `address`.
    pub fn write_words(
        &self,
        region: WordRegion,
        address: u16,
        values: &[u16],
    ) -> Result<(), AddressError> {
        let window = self.word_window(region, address.into(), values.len())?;
        self.update(|t| t.words_mut(&window).copy_from_slice(values));
        Ok(())
    }

    /// Apply `(current & and_mask) | (or_mask & !and_mask)` to one holding
    /// register and return the new value.
    pub fn mask_write_word(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<u16, AddressError> {
        let window = self.word_window(WordRegion::HoldingRegisters, address.into(), 1)?;
        Ok(self.update(|t| {
            let slot = &mut t.words_mut(&window)[0];
            *slot = (*slot & and_mask) | (or_mask & !and_mask);
            *slot
        }))
    }

    /// Write holding registers, then read holding registers, as one atomic step.
    pub fn write_then_read_words(
        &self,
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: &[u16],
    ) -> Result<Vec<u16>, AddressError> {
        let read = self.word_window(
            WordRegion::HoldingRegisters,
            read_address.into(),
            read_count.into(),
        )?;
        let write = self.word_window(
            WordRegion::HoldingRegisters,
            write_address.into(),
            values.len(),
        )?;

        Ok(self.update(|t| {
            t.words_mut(&write).copy_from_slice(values);
            t.words(&read).to_vec()
        }))
    }
}
