use std::fmt;

#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    ES,
    CS,
    SS,
    DS,
    FS,
    GS,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Segment {
    pub fn as_str(self) -> &'static str {
        match self {
            Segment::ES => "es",
            Segment::CS => "cs",
            Segment::SS => "ss",
            Segment::DS => "ds",
            Segment::FS => "fs",
            Segment::GS => "gs",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Segment::ES => 0,
            Segment::CS => 1,
            Segment::SS => 2,
            Segment::DS => 3,
            Segment::FS => 4,
            Segment::GS => 5,
        }
    }
}

// access rights, in the layout used by VMX guest segment fields
pub const ATTR_TYPE_MASK: u32 = 0x000F;
pub const ATTR_ACCESSED: u32 = 0x0001;
pub const ATTR_CODE: u32 = 0x0008;
pub const ATTR_CONFORMING: u32 = 0x0004;
pub const ATTR_WRITABLE: u32 = 0x0002;
pub const ATTR_S: u32 = 0x0010;
pub const ATTR_DPL_SHIFT: u32 = 5;
pub const ATTR_PRESENT: u32 = 0x0080;
pub const ATTR_L: u32 = 0x2000;
pub const ATTR_DB: u32 = 0x4000;
pub const ATTR_G: u32 = 0x8000;
pub const ATTR_UNUSABLE: u32 = 0x1_0000;

/// system descriptor types
pub const TYPE_LDT: u32 = 0x2;
pub const TYPE_TSS16_AVAILABLE: u32 = 0x1;
pub const TYPE_TSS_AVAILABLE: u32 = 0x9;

/// a cached segment register, or a descriptor table register
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub selector: u16,
    pub attrib: u32,
    pub limit: u32,
    pub base: u64,
}

impl SegmentDescriptor {
    pub fn new(selector: u16, attrib: u32, limit: u32, base: u64) -> Self {
        SegmentDescriptor { selector, attrib, limit, base }
    }

    /// a descriptor marked unusable, as loaded by a null selector
    pub fn unusable(selector: u16) -> Self {
        SegmentDescriptor { selector, attrib: ATTR_UNUSABLE, limit: 0, base: 0 }
    }

    /// flat 4GB code segment at `dpl`, long mode when `long` is set
    pub fn flat_code(selector: u16, dpl: u8, long: bool) -> Self {
        let mut attrib = 0xB | ATTR_S | ATTR_PRESENT | ATTR_G | ((dpl as u32 & 3) << ATTR_DPL_SHIFT);
        attrib |= if long { ATTR_L } else { ATTR_DB };
        SegmentDescriptor::new(selector, attrib, 0xFFFF_FFFF, 0)
    }

    /// flat 4GB writable data segment at `dpl`
    pub fn flat_data(selector: u16, dpl: u8) -> Self {
        let attrib = 0x3 | ATTR_S | ATTR_PRESENT | ATTR_G | ATTR_DB | ((dpl as u32 & 3) << ATTR_DPL_SHIFT);
        SegmentDescriptor::new(selector, attrib, 0xFFFF_FFFF, 0)
    }

    pub fn kind(&self) -> u32 {
        self.attrib & ATTR_TYPE_MASK
    }

    pub fn dpl(&self) -> u8 {
        ((self.attrib >> ATTR_DPL_SHIFT) & 3) as u8
    }

    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    pub fn is_present(&self) -> bool {
        self.attrib & ATTR_PRESENT != 0
    }

    pub fn is_system(&self) -> bool {
        self.attrib & ATTR_S == 0
    }

    pub fn is_code(&self) -> bool {
        !self.is_system() && self.attrib & ATTR_CODE != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.attrib & ATTR_CONFORMING != 0
    }

    /// a data segment that can be loaded into SS
    pub fn is_writable_data(&self) -> bool {
        !self.is_system() && !self.is_code() && self.attrib & ATTR_WRITABLE != 0
    }

    pub fn is_long(&self) -> bool {
        self.attrib & ATTR_L != 0
    }

    pub fn is_default_big(&self) -> bool {
        self.attrib & ATTR_DB != 0
    }

    pub fn is_unusable(&self) -> bool {
        self.attrib & ATTR_UNUSABLE != 0
    }
}

/// returns true if `selector` references the null descriptor
pub fn is_null_selector(selector: u16) -> bool {
    selector & !3 == 0
}
