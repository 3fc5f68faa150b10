use super::{Node, RenderContext};
use crate::argument::Argument;
use crate::core::{DacError, Result};
use serde::{Deserialize, Serialize};

/// Offset/length window over a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    offset: u64,
    length: u64,
}

impl Range {
    /// Fails unless `length >= 1`.
    pub fn new(offset: u64, length: u64) -> Result<Self> {
        if length == 0 {
            return Err(DacError::invalid_operands("range", "length must be at least 1"));
        }
        Ok(Self { offset, length })
    }

    /// The first row only.
    pub fn first() -> Self {
        Self {
            offset: 0,
            length: 1,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// The page this range covers, when it is aligned on its length.
    pub fn page(&self) -> Option<Page> {
        if self.offset % self.length != 0 {
            return None;
        }
        Some(Page {
            no: self.offset / self.length + 1,
            size: self.length,
        })
    }
}

impl Node for Range {
    fn render(&self, ctx: &mut RenderContext<'_>, out: &mut String) -> Result<Vec<Argument>> {
        ctx.dialect().render_range(self, out);
        Ok(Vec::new())
    }
}

/// 1-based page number and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    no: u64,
    size: u64,
}

impl Page {
    /// Fails unless `no >= 1` and `size >= 1`.
    pub fn new(no: u64, size: u64) -> Result<Self> {
        if no == 0 || size == 0 {
            return Err(DacError::invalid_operands(
                "page",
                "page number and size must be at least 1",
            ));
        }
        Ok(Self { no, size })
    }

    pub fn no(&self) -> u64 {
        self.no
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn range(&self) -> Range {
        Range {
            offset: (self.no - 1) * self.size,
            length: self.size,
        }
    }
}
