//! The continuation cache: memoized, lineage-aware resume unit generation.
//!
//! # Lifetimes
//!
//! Units are identified by their allocation. The cache holds every unit it keys on
//! weakly, so a memo entry never keeps its unit alive; the allocation behind a
//! `Weak` is not reused while the `Weak` exists, which keeps identities unique. A
//! generated unit is held strongly by the memo entry of the root it was generated
//! from, so its lineage record lives exactly as long as that entry. Answers
//! memoized under a generated unit are held weakly. Entries whose unit has been
//! dropped are pruned before every insertion.
//!
//! # Lineage
//!
//! Generating from a generated unit never builds on it: the request is moved into
//! the offsets of that unit's root and answered there. Roots are never generated
//! units, so the redirect is a single hop and independent resume points that
//! converge on the same later point share one generated unit.

use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::{
    bytecode::CodeUnit,
    config::ResumeConfig,
    era::{Era, EraCapabilities},
    error::{ResumeError, ResumeResult},
    key::ResumeKey,
    metadata::ResumeMetadata,
    synthesis::{check_supported, synthesize},
    template::{ReferenceCompiler, SnippetCompiler},
    tracer::{NoopTracer, ResumeTracer},
};

/// Identity of a unit: the address of its shared allocation.
type UnitId = usize;

fn unit_id(unit: &Rc<CodeUnit>) -> UnitId {
    Rc::as_ptr(unit).addr()
}

#[derive(Debug)]
struct MemoEntry {
    unit: Weak<CodeUnit>,
    by_line: AHashMap<u32, AHashMap<ResumeKey, Memoized>>,
}

/// A memoized answer. Answers for roots own the generated unit; answers for
/// generated units only point at a unit owned by the root's entry, so no two
/// generated units can keep each other (or themselves) alive.
#[derive(Debug)]
enum Memoized {
    Owned(Rc<CodeUnit>),
    Borrowed(Weak<CodeUnit>),
}

impl Memoized {
    fn get(&self) -> Option<Rc<CodeUnit>> {
        match self {
            Self::Owned(unit) => Some(Rc::clone(unit)),
            Self::Borrowed(unit) => unit.upgrade(),
        }
    }
}

#[derive(Debug)]
struct LineageEntry {
    unit: Weak<CodeUnit>,
    meta: ResumeMetadata,
}

/// Memoizing generator of resume units.
///
/// Construct one per frontend and pass it by reference. The cache is
/// single-threaded; callers generating for the same root from several threads must
/// serialize externally.
///
/// ```
/// use std::rc::Rc;
///
/// use resumption::{CodeUnitBuilder, ContinuationCache, Era, Opcode, ResumeKey};
///
/// let mut b = CodeUnitBuilder::new("f", Era::RegionTable);
/// b.param("x");
/// b.emit(Opcode::Resume);
/// b.set_line(2);
/// b.emit_load_fast("x");
/// b.emit(Opcode::ReturnValue);
/// let f = Rc::new(b.build().unwrap());
///
/// let mut cache = ContinuationCache::new(Era::RegionTable);
/// let key = ResumeKey::new(4, 1);
/// let resumed = cache.lookup(&f, 2, &key).unwrap();
/// assert_eq!(resumed.name(), "__resume_in_f_at_2");
/// assert!(Rc::ptr_eq(&resumed, &cache.lookup(&f, 2, &key).unwrap()));
/// ```
#[derive(Debug)]
pub struct ContinuationCache<C = ReferenceCompiler, T = NoopTracer> {
    caps: EraCapabilities,
    config: ResumeConfig,
    compiler: C,
    tracer: T,
    memo: AHashMap<UnitId, MemoEntry>,
    lineage: AHashMap<UnitId, LineageEntry>,
}

impl ContinuationCache {
    /// Cache for units of `era`, with the conventional names and snippets.
    #[must_use]
    pub fn new(era: Era) -> Self {
        Self::with_parts(era, ResumeConfig::default(), ReferenceCompiler, NoopTracer)
    }

    /// As [`ContinuationCache::new`], with custom names.
    #[must_use]
    pub fn with_config(era: Era, config: ResumeConfig) -> Self {
        Self::with_parts(era, config, ReferenceCompiler, NoopTracer)
    }
}

impl<C: SnippetCompiler, T: ResumeTracer> ContinuationCache<C, T> {
    /// Cache with every collaborator supplied.
    #[must_use]
    pub fn with_parts(era: Era, config: ResumeConfig, compiler: C, tracer: T) -> Self {
        Self {
            caps: era.capabilities(),
            config,
            compiler,
            tracer,
            memo: AHashMap::new(),
            lineage: AHashMap::new(),
        }
    }

    /// Replaces the snippet compiler. Existing entries are kept.
    #[must_use]
    pub fn with_compiler<C2: SnippetCompiler>(self, compiler: C2) -> ContinuationCache<C2, T> {
        ContinuationCache {
            caps: self.caps,
            config: self.config,
            compiler,
            tracer: self.tracer,
            memo: self.memo,
            lineage: self.lineage,
        }
    }

    /// Replaces the tracer. Existing entries are kept.
    #[must_use]
    pub fn with_tracer<T2: ResumeTracer>(self, tracer: T2) -> ContinuationCache<C, T2> {
        ContinuationCache {
            caps: self.caps,
            config: self.config,
            compiler: self.compiler,
            tracer,
            memo: self.memo,
            lineage: self.lineage,
        }
    }

    /// Returns the resume unit of `code` for `line` and `key`, generating it on
    /// first request.
    ///
    /// Requests against a generated unit are answered from its root, so the returned
    /// unit is never derived from another generated unit. The cache holds roots
    /// weakly: keep a root alive for as long as its continuations may be resumed
    /// from, otherwise such requests fail with
    /// [`ResumeError::StructuralInconsistency`].
    ///
    /// # Errors
    ///
    /// - [`ResumeError::UnsupportedUnitKind`] if `code` is generator-like, not
    ///   optimized, or of another era.
    /// - [`ResumeError::StructuralInconsistency`] if the key disagrees with the
    ///   unit's structure or the lineage cannot be resolved.
    /// - [`ResumeError::TemplateMarkerNotFound`] if a re-entry snippet is malformed.
    pub fn lookup(&mut self, code: &Rc<CodeUnit>, line: u32, key: &ResumeKey) -> ResumeResult<Rc<CodeUnit>> {
        let result = self.lookup_inner(code, line, key);
        if let Err(err) = &result {
            self.tracer.on_fault(code.qualname(), err);
        }
        result
    }

    fn lookup_inner(&mut self, code: &Rc<CodeUnit>, line: u32, key: &ResumeKey) -> ResumeResult<Rc<CodeUnit>> {
        check_supported(code, &self.caps)?;
        if let Some(hit) = self.memoized(code, line, key) {
            self.tracer.on_hit(code.qualname(), line, key.offset());
            return Ok(hit);
        }
        self.tracer.on_miss(code.qualname(), line, key.offset());

        let unit = if self.lineage.contains_key(&unit_id(code)) {
            self.redirect(code, line, key)?
        } else {
            self.generate(code, line, key)?
        };
        self.remember(code, line, key.clone(), Rc::clone(&unit));
        Ok(unit)
    }

    /// Answers a request against a generated unit from its root.
    fn redirect(&mut self, code: &Rc<CodeUnit>, line: u32, key: &ResumeKey) -> ResumeResult<Rc<CodeUnit>> {
        let entry = self.lineage.get(&unit_id(code)).ok_or_else(|| {
            ResumeError::inconsistent(code.qualname(), "generated unit has no lineage record")
        })?;
        let root = entry
            .meta
            .root()
            .ok_or_else(|| ResumeError::inconsistent(code.qualname(), "root unit has been dropped"))?;
        let offset = entry.meta.root_offset(code, key.offset())?;
        let targets = if self.caps.structural_regions() {
            key.resource_targets()
                .iter()
                .map(|target| entry.meta.root_resource_target(code, *target))
                .collect::<ResumeResult<Vec<_>>>()?
        } else {
            key.resource_targets().to_vec()
        };
        if self.lineage.contains_key(&unit_id(&root)) {
            return Err(ResumeError::inconsistent(
                code.qualname(),
                format!("lineage root `{}` is itself a generated unit", root.qualname()),
            ));
        }

        self.tracer.on_redirect(code.qualname(), root.qualname(), key.offset(), offset);
        let root_key = key.relocated(offset, targets);
        if let Some(hit) = self.memoized(&root, line, &root_key) {
            self.tracer.on_hit(root.qualname(), line, offset);
            return Ok(hit);
        }
        self.tracer.on_miss(root.qualname(), line, offset);
        let unit = self.generate(&root, line, &root_key)?;
        self.remember(&root, line, root_key, Rc::clone(&unit));
        Ok(unit)
    }

    /// Synthesizes a new unit from a root and records its lineage.
    fn generate(&mut self, root: &Rc<CodeUnit>, line: u32, key: &ResumeKey) -> ResumeResult<Rc<CodeUnit>> {
        let synthesis = synthesize(root, line, key, &self.caps, &self.compiler, &self.config)?;
        let unit = Rc::new(synthesis.unit);
        self.prune();
        self.lineage.insert(
            unit_id(&unit),
            LineageEntry {
                unit: Rc::downgrade(&unit),
                meta: ResumeMetadata::new(root, synthesis.instructions, synthesis.prefix_guard_targets),
            },
        );
        self.tracer.on_generated(root.qualname(), unit.qualname(), line, key.offset());
        Ok(unit)
    }

    fn memoized(&self, code: &Rc<CodeUnit>, line: u32, key: &ResumeKey) -> Option<Rc<CodeUnit>> {
        let entry = self.memo.get(&unit_id(code))?;
        if !entry.unit.ptr_eq(&Rc::downgrade(code)) {
            return None;
        }
        entry.by_line.get(&line)?.get(key)?.get()
    }

    fn remember(&mut self, code: &Rc<CodeUnit>, line: u32, key: ResumeKey, unit: Rc<CodeUnit>) {
        self.prune();
        let unit = if self.is_generated(code) {
            Memoized::Borrowed(Rc::downgrade(&unit))
        } else {
            Memoized::Owned(unit)
        };
        let entry = self.memo.entry(unit_id(code)).or_insert_with(|| MemoEntry {
            unit: Rc::downgrade(code),
            by_line: AHashMap::new(),
        });
        entry.by_line.entry(line).or_default().insert(key, unit);
    }

    /// Root of a generated unit, or `None` if `unit` was not generated by this
    /// cache (or its root is gone).
    #[must_use]
    pub fn root_of(&self, unit: &Rc<CodeUnit>) -> Option<Rc<CodeUnit>> {
        self.lineage_of(unit)?.meta.root()
    }

    /// Whether `unit` was generated by this cache.
    #[must_use]
    pub fn is_generated(&self, unit: &Rc<CodeUnit>) -> bool {
        self.lineage_of(unit).is_some()
    }

    fn lineage_of(&self, unit: &Rc<CodeUnit>) -> Option<&LineageEntry> {
        self.lineage
            .get(&unit_id(unit))
            .filter(|entry| entry.unit.ptr_eq(&Rc::downgrade(unit)))
    }

    /// Number of memoized `(unit, line, key)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memo
            .values()
            .flat_map(|entry| entry.by_line.values())
            .map(|by_key| by_key.len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every memoized unit and lineage record.
    pub fn clear(&mut self) {
        self.memo.clear();
        self.lineage.clear();
    }

    /// Drops entries whose unit has been freed.
    ///
    /// Memo entries go first: they own the generated units whose lineage records
    /// are dropped next. Dropping a root's entry can free generated units whose
    /// own entries were already visited, so the memo is swept until it is stable.
    pub fn prune(&mut self) {
        loop {
            let before = self.memo.len();
            self.memo.retain(|_, entry| entry.unit.strong_count() > 0);
            if self.memo.len() == before {
                break;
            }
        }
        self.lineage.retain(|_, entry| entry.unit.strong_count() > 0);
    }

    #[must_use]
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut T {
        &mut self.tracer
    }

    #[must_use]
    pub fn config(&self) -> &ResumeConfig {
        &self.config
    }

    #[must_use]
    pub fn capabilities(&self) -> &EraCapabilities {
        &self.caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeFlags, CodeUnitBuilder, Opcode};

    fn straight_line(era: Era) -> Rc<CodeUnit> {
        let mut b = CodeUnitBuilder::new("f", era);
        b.param("x");
        b.set_line(1);
        b.emit_load_fast("x");
        b.emit(Opcode::PopTop);
        b.set_line(2);
        b.emit_load_fast("x");
        b.emit(Opcode::ReturnValue);
        Rc::new(b.build().unwrap())
    }

    #[test]
    fn dropped_units_are_pruned() {
        let mut cache = ContinuationCache::new(Era::BlockStack);
        let f = straight_line(Era::BlockStack);
        let resumed = cache.lookup(&f, 2, &ResumeKey::new(4, 0).with_live_locals(["x"])).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.is_generated(&resumed));
        drop(resumed);
        drop(f);
        cache.prune();
        assert!(cache.is_empty());
        assert!(cache.lineage.is_empty());
    }

    #[test]
    fn era_mismatch_is_unsupported() {
        let mut cache = ContinuationCache::new(Era::RegionTable);
        let f = straight_line(Era::BlockStack);
        let err = cache.lookup(&f, 2, &ResumeKey::new(4, 0)).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedUnitKind");
    }

    #[test]
    fn non_optimized_unit_is_unsupported() {
        let mut b = CodeUnitBuilder::new("module", Era::BlockStack);
        b.flags(CodeFlags::empty());
        b.emit_const(crate::bytecode::Constant::None);
        b.emit(Opcode::ReturnValue);
        let module = Rc::new(b.build().unwrap());
        let mut cache = ContinuationCache::new(Era::BlockStack);
        assert!(matches!(
            cache.lookup(&module, 1, &ResumeKey::new(2, 0)),
            Err(ResumeError::UnsupportedUnitKind { .. })
        ));
        assert!(cache.is_empty());
    }
}
