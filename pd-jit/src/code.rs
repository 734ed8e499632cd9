use serde::Serialize;

use crate::error::JitResult;
use crate::memory::ExecutableRegion;
use crate::repatch::RepatchBuffer;
use crate::site::{Label, PatchSite};

/// Published machine code for one calling convention of a script, with the
/// patch sites the code generator handed out for it.
#[derive(Debug)]
pub struct JitCode {
    region: ExecutableRegion,
    entry: Label,
    sites: Vec<(String, PatchSite)>,
    labels: Vec<(String, Label)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CodeSummary {
    pub arch: &'static str,
    pub start: usize,
    pub entry: usize,
    pub code_len: usize,
    pub region_size: usize,
    pub sites: Vec<String>,
}

impl JitCode {
    pub fn new(region: ExecutableRegion, entry: Label) -> Self {
        Self {
            region,
            entry,
            sites: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_site(mut self, name: impl Into<String>, site: PatchSite) -> Self {
        self.sites.push((name.into(), site));
        self
    }

    pub fn site(&self, name: &str) -> Option<&PatchSite> {
        self.sites
            .iter()
            .find(|(site_name, _)| site_name == name)
            .map(|(_, site)| site)
    }

    /// Names an in-code position, e.g. a stub that a later repatch retargets to.
    pub fn with_label(mut self, name: impl Into<String>, label: Label) -> Self {
        self.labels.push((name.into(), label));
        self
    }

    pub fn label_address(&self, name: &str) -> Option<usize> {
        self.labels
            .iter()
            .find(|(label_name, _)| label_name == name)
            .map(|(_, label)| self.region.start() + label.offset())
    }

    pub fn entry_address(&self) -> usize {
        self.region.start() + self.entry.offset()
    }

    pub fn region(&self) -> &ExecutableRegion {
        &self.region
    }

    /// Opens the code for in-place edits.
    pub fn repatch(&self) -> JitResult<RepatchBuffer<'_>> {
        RepatchBuffer::new(&self.region)
    }

    pub fn summary(&self) -> CodeSummary {
        CodeSummary {
            arch: self.region.encoder().arch().name(),
            start: self.region.start(),
            entry: self.entry.offset(),
            code_len: self.region.code_len(),
            region_size: self.region.size(),
            sites: self.sites.iter().map(|(name, _)| name.clone()).collect(),
        }
    }
}
