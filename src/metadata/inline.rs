//! The inlined call site table.
//!
//! Each element is a method word and a 32-bit bytecode info, padded to a
//! word boundary, followed by a stack map of the atlas's map size. The
//! bytecode info's caller index links each site to the site it was inlined
//! into, forming a chain from the innermost method outwards.

use alloc::vec::Vec;

use super::{ByteCodeInfo, CompiledMethod, MapEntry, Result};
use crate::{error::FatalWalkError, Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlinedCallSite {
    pub address: Addr,
    pub index: usize,
    pub method: Addr,
    pub info: ByteCodeInfo,
}

/// A pc range of the method body where inlined code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineRange {
    pub start_offset: u64,
    /// Inclusive.
    pub end_offset: u64,
    /// The innermost inlined method in the range.
    pub innermost: InlinedCallSite,
}

impl<'m> CompiledMethod<'m> {
    pub fn inlined_call_site_size(&self) -> u64 {
        let word = self.target().word_size() as u64;
        (word + 4).div_ceil(word) * word + self.map_bytes()
    }

    pub fn inlined_call_site_count(&self) -> usize {
        let md = &self.metadata;
        if md.inlined_calls.is_null() || md.gc_stack_atlas.is_null() {
            return 0;
        }
        let table = md.gc_stack_atlas.0.saturating_sub(md.inlined_calls.0);
        (table / self.inlined_call_site_size()) as usize
    }

    /// Reads the element at `index`, which must lie inside the table.
    pub fn call_site(&self, index: i32) -> Result<InlinedCallSite> {
        let index = usize::try_from(index)
            .ok()
            .filter(|&index| index < self.inlined_call_site_count())
            .ok_or(FatalWalkError::Malformed {
                what: "inlined call site index",
                value: index as u64,
            })?;
        let target = self.target();
        let address = self
            .metadata
            .inlined_calls
            .byte_add((index as u64 * self.inlined_call_site_size()) as i64);
        let method = target.read_addr(address)?;
        let info = ByteCodeInfo::read(target, address.byte_add(target.word_size() as i64))?;
        Ok(InlinedCallSite {
            address,
            index,
            method,
            info,
        })
    }

    /// Longest chain a well-formed table can have.
    fn chain_limit(&self) -> usize {
        self.inlined_call_site_count() + 1
    }

    fn cycle(&self, site: &InlinedCallSite) -> FatalWalkError {
        FatalWalkError::Malformed {
            what: "inlined call site chain does not terminate at",
            value: site.index as u64,
        }
    }

    /// Steps over sites whose method was unloaded.
    fn skip_unloaded(&self, mut site: InlinedCallSite) -> Result<Option<InlinedCallSite>> {
        let mut steps = 0;
        while self.is_unloaded(site.method) {
            if !site.info.has_caller() {
                return Ok(None);
            }
            steps += 1;
            if steps > self.chain_limit() {
                return Err(self.cycle(&site));
            }
            site = self.call_site(site.info.caller_index)?;
        }
        Ok(Some(site))
    }

    /// The innermost method inlined at `inline_map`.
    pub fn first_call_site(&self, inline_map: &MapEntry) -> Result<Option<InlinedCallSite>> {
        if !inline_map.info.has_caller() || self.metadata.inlined_calls.is_null() {
            return Ok(None);
        }
        self.skip_unloaded(self.call_site(inline_map.info.caller_index)?)
    }

    /// The site `site` was inlined into, if it is not the outermost one.
    pub fn next_call_site(&self, site: &InlinedCallSite) -> Result<Option<InlinedCallSite>> {
        if !site.info.has_caller() {
            return Ok(None);
        }
        self.skip_unloaded(self.call_site(site.info.caller_index)?)
    }

    /// All inlined methods active at `inline_map`, innermost first.
    pub fn call_site_chain(&self, inline_map: &MapEntry) -> Result<Vec<InlinedCallSite>> {
        let mut chain = Vec::new();
        let mut site = self.first_call_site(inline_map)?;
        while let Some(current) = site {
            if chain.len() >= self.chain_limit() {
                return Err(self.cycle(&current));
            }
            chain.push(current);
            site = self.next_call_site(&current)?;
        }
        Ok(chain)
    }

    /// Number of inlined methods active at `inline_map`.
    pub fn inline_depth(&self, inline_map: &MapEntry) -> Result<usize> {
        Ok(self.call_site_chain(inline_map)?.len())
    }

    /// The bytecode position the frame of `current` is at, or the outermost
    /// method's position with `None`.
    ///
    /// A method stopped at a call into an inlined method is at that call
    /// site's position, so every frame but the innermost takes its position
    /// from the site one step further in.
    pub fn current_byte_code_info(
        &self,
        inline_map: &MapEntry,
        current: Option<&InlinedCallSite>,
    ) -> Result<ByteCodeInfo> {
        let chain = self.call_site_chain(inline_map)?;
        let inner = match current {
            Some(current) => match chain.iter().position(|site| site == current) {
                Some(0) | None => None,
                Some(at) => chain.get(at - 1),
            },
            None => chain.last(),
        };
        Ok(inner.map_or(inline_map.info, |site| site.info))
    }

    /// Sites whose method is still loaded and unpatched. Their classes are
    /// live as long as this method is.
    pub fn loaded_call_sites(&self) -> Result<Vec<InlinedCallSite>> {
        let mut sites = Vec::new();
        for index in 0..self.inlined_call_site_count() {
            let site = self.call_site(index as i32)?;
            if !self.is_patched(site.method) {
                sites.push(site);
            }
        }
        Ok(sites)
    }

    /// The pc ranges that run inlined code.
    pub fn inline_ranges(&self) -> Result<Vec<InlineRange>> {
        let mut ranges = Vec::new();
        for entry in self.maps() {
            let entry = entry?;
            if let Some(innermost) = self.first_call_site(&entry)? {
                ranges.push(InlineRange {
                    start_offset: entry.range_start,
                    end_offset: entry.range_end,
                    innermost,
                });
            }
        }
        Ok(ranges)
    }
}
