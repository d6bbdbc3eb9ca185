//! The procedure table: a static mapping from procedure name/id to the
//! callable run on a worker core.

use fnv::FnvHashMap;

use offload_api::{EaDirection, Error, ProcId, ScalarArgs};

/// A marshaled remote argument as the procedure sees it: a region of the
/// worker's private scratch memory.
#[derive(Debug)]
pub struct LocalRegion {
    addr: usize,
    len: usize,
    direction: EaDirection,
}

impl LocalRegion {
    pub(crate) fn new(addr: usize, len: usize, direction: EaDirection) -> Self {
        LocalRegion {
            addr,
            len,
            direction,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn direction(&self) -> EaDirection {
        self.direction
    }

    /// The staged bytes of a GET argument (or the current contents of a PUT
    /// region).
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the worker staged this region in its private scratch and
        // lends it exclusively to the procedure for the duration of the call.
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.addr as *mut u8, self.len) }
    }
}

/// A procedure invoked on a worker core: scalar inputs, scalar outputs, and
/// the marshaled remote-argument regions in submission order.
pub type ProcFn = fn(&ScalarArgs, &mut ScalarArgs, &mut [LocalRegion]);

/// One registered procedure. Immutable after table construction.
pub struct ProcEntry {
    pub id: ProcId,
    pub name: String,
    pub func: ProcFn,
}

/// The static id/name -> callable mapping, supplied by the block library (or
/// other collaborator) at manager construction.
pub struct ProcTable {
    entries: Vec<ProcEntry>,
    by_name: FnvHashMap<String, ProcId>,
}

impl ProcTable {
    /// Builds a table from `(name, callable)` pairs; ids are assigned in
    /// registration order.
    pub fn new<I, S>(procs: I) -> Self
    where
        I: IntoIterator<Item = (S, ProcFn)>,
        S: Into<String>,
    {
        let mut entries = Vec::new();
        let mut by_name = FnvHashMap::default();
        for (name, func) in procs {
            let name = name.into();
            let id = ProcId(entries.len() as u32);
            let prev = by_name.insert(name.clone(), id);
            assert!(prev.is_none(), "duplicate procedure name: {name}");
            entries.push(ProcEntry { id, name, func });
        }
        ProcTable { entries, by_name }
    }

    /// Resolves a procedure name to its id.
    pub fn lookup(&self, name: &str) -> Result<ProcId, Error> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownProcedure(name.to_string()))
    }

    /// Fetches an entry by id; `None` for ids outside the table's range.
    #[inline]
    pub fn get(&self, id: ProcId) -> Option<&ProcEntry> {
        self.entries.get(id.0 as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &ScalarArgs, _: &mut ScalarArgs, _: &mut [LocalRegion]) {}

    #[test]
    fn lookup_by_name() {
        let table = ProcTable::new([("alpha", nop as ProcFn), ("beta", nop as ProcFn)]);
        assert_eq!(table.lookup("alpha").unwrap(), ProcId(0));
        assert_eq!(table.lookup("beta").unwrap(), ProcId(1));
        assert!(matches!(
            table.lookup("gamma"),
            Err(Error::UnknownProcedure(_))
        ));
    }

    #[test]
    fn out_of_range_id() {
        let table = ProcTable::new([("alpha", nop as ProcFn)]);
        assert!(table.get(ProcId(0)).is_some());
        assert!(table.get(ProcId(7)).is_none());
        assert!(table.get(ProcId::INVALID).is_none());
    }
}
