use std::sync::LazyLock;

use nonempty::NonEmpty;
use regex::Regex;

use crate::error::DfuError;

static CONTIGUOUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"/\s*0x([0-9a-fA-F]{1,8})\s*/(?:\s*[0-9]+\s*\*\s*[0-9]+\s?[ BKM]\s*[a-g]\s*,?\s*)+",
    )
    .unwrap()
});

static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+)\s*\*\s*([0-9]+)\s?([ BKM])\s*([a-g])\s*,?\s*")
        .unwrap()
});

/// DfuSe memory map parsed from an alternate setting name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryInfo {
    pub name: String,
    pub segments: NonEmpty<DfuMemSegment>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemSegment {
    start_addr: u32,
    end_addr: u32,
    sector_size: u32,
    mem_type: u8,
}

/// One step of a sector erase walk, see [`MemoryInfo::erase_plan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseStep {
    /// Issue `ERASE_SECTOR` for the sector at `addr`.
    Erase { addr: u32, size: u32 },
    /// Non-erasable memory; advance without sending anything.
    Skip { addr: u32, size: u32 },
}

impl EraseStep {
    pub fn size(&self) -> u32 {
        match self {
            EraseStep::Erase { size, .. } | EraseStep::Skip { size, .. } => {
                *size
            }
        }
    }
}

impl DfuMemSegment {
    const READABLE: u8 = 1 << 0;
    const ERASABLE: u8 = 1 << 1;
    const WRITABLE: u8 = 1 << 2;

    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    /// First address past the segment.
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
    pub fn sectors(&self) -> u32 {
        (self.end_addr - self.start_addr) / self.sector_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        self.start_addr <= addr && addr < self.end_addr
    }
    pub fn readable(&self) -> bool {
        self.mem_type & Self::READABLE != 0
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & Self::ERASABLE != 0
    }
    pub fn writable(&self) -> bool {
        self.mem_type & Self::WRITABLE != 0
    }

    /// `addr` must lie inside the segment.
    pub(crate) fn sector_start(&self, addr: u32) -> u32 {
        self.start_addr
            + (addr - self.start_addr) / self.sector_size * self.sector_size
    }

    pub(crate) fn sector_end(&self, addr: u32) -> u32 {
        self.sector_start(addr) + self.sector_size
    }
}

impl MemoryInfo {
    /// Parse a DfuSe memory descriptor such as
    /// `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`.
    pub fn parse(desc: &str) -> Result<Self, DfuError> {
        let name_end = match desc.find('/') {
            Some(idx) if desc.starts_with('@') => idx,
            _ => {
                return Err(DfuError::Format(format!(
                    "Not a DfuSe memory descriptor: \"{desc}\""
                )));
            }
        };
        let name = desc[1..name_end].trim().to_string();

        let mut segments = Vec::new();
        for block in CONTIGUOUS_RE.captures_iter(&desc[name_end..]) {
            let mut current_addr = u32::from_str_radix(&block[1], 16)
                .map_err(|e| DfuError::Format(format!("{e}")))?;

            for seg in SEGMENT_RE.captures_iter(&block[0]) {
                let sectors: u32 = parse_number(&seg[1])?;
                let sector_size = parse_number::<u32>(&seg[2])?
                    .checked_mul(unit_multiplier(&seg[3]))
                    .ok_or_else(|| overflow(desc))?;
                if sector_size == 0 {
                    return Err(DfuError::Format(format!(
                        "zero sector size in \"{desc}\""
                    )));
                }
                let mem_type = seg[4].as_bytes()[0] - b'a' + 1;
                let end_addr = sector_size
                    .checked_mul(sectors)
                    .and_then(|len| current_addr.checked_add(len))
                    .ok_or_else(|| overflow(desc))?;

                segments.push(DfuMemSegment {
                    start_addr: current_addr,
                    end_addr,
                    sector_size,
                    mem_type,
                });
                current_addr = end_addr;
            }
        }

        let segments = NonEmpty::from_vec(segments).ok_or_else(|| {
            DfuError::Format(format!("No memory segments in \"{desc}\""))
        })?;
        Ok(MemoryInfo { name, segments })
    }

    /// First segment covering `addr`.
    pub fn segment(&self, addr: u32) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    fn resolve<'a>(
        &'a self,
        addr: u32,
        segment: Option<&'a DfuMemSegment>,
    ) -> Result<&'a DfuMemSegment, DfuError> {
        segment
            .filter(|s| s.contains(addr))
            .or_else(|| self.segment(addr))
            .ok_or(DfuError::OutsideMemoryMap(addr))
    }

    pub fn sector_start(
        &self,
        addr: u32,
        segment: Option<&DfuMemSegment>,
    ) -> Result<u32, DfuError> {
        Ok(self.resolve(addr, segment)?.sector_start(addr))
    }

    pub fn sector_end(
        &self,
        addr: u32,
        segment: Option<&DfuMemSegment>,
    ) -> Result<u32, DfuError> {
        Ok(self.resolve(addr, segment)?.sector_end(addr))
    }

    pub fn first_writable_segment(&self) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.writable())
    }

    /// Number of bytes that can be read from `start_addr` on, following
    /// address-adjacent readable segments.
    pub fn max_read_size(&self, start_addr: u32) -> u32 {
        let mut num_bytes: u32 = 0;
        for segment in &self.segments {
            if segment.contains(start_addr) {
                if !segment.readable() {
                    return 0;
                }
                num_bytes =
                    num_bytes.saturating_add(segment.end_addr - start_addr);
            } else if start_addr.checked_add(num_bytes)
                == Some(segment.start_addr)
            {
                if !segment.readable() {
                    break;
                }
                num_bytes = num_bytes
                    .saturating_add(segment.end_addr - segment.start_addr);
            }
        }
        num_bytes
    }

    /// Sector walk covering `[start_addr, start_addr + length)`.
    ///
    /// The walk starts at the sector containing `start_addr` and ends with
    /// the sector containing the last byte. Non-erasable stretches are
    /// returned as [`EraseStep::Skip`] clipped to the walk's range.
    pub fn erase_plan(
        &self,
        start_addr: u32,
        length: u32,
    ) -> Result<Vec<EraseStep>, DfuError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let last = start_addr
            .checked_add(length - 1)
            .ok_or(DfuError::OutsideMemoryMap(u32::MAX))?;
        let mut segment = self.resolve(start_addr, None)?;
        let mut addr = segment.sector_start(start_addr);
        let end_addr = self.sector_end(last, None)?;

        let mut steps = Vec::new();
        while addr < end_addr {
            if segment.end_addr <= addr {
                segment = self.resolve(addr, None)?;
            }
            if !segment.erasable() {
                let skip_end = segment.end_addr.min(end_addr);
                steps.push(EraseStep::Skip {
                    addr,
                    size: skip_end - addr,
                });
                addr = segment.end_addr;
                continue;
            }
            let sector_addr = segment.sector_start(addr);
            steps.push(EraseStep::Erase {
                addr: sector_addr,
                size: segment.sector_size,
            });
            addr = sector_addr + segment.sector_size;
        }
        Ok(steps)
    }
}

fn unit_multiplier(unit: &str) -> u32 {
    match unit {
        "K" => 1024,
        "M" => 1024 * 1024,
        _ => 1,
    }
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, DfuError>
where
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e| DfuError::Format(format!("{s}: {e}")))
}

fn overflow(desc: &str) -> DfuError {
    DfuError::Format(format!("Address overflow in \"{desc}\""))
}
