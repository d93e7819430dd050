//! Evaluation engines.
#[cfg(feature = "mpi")]
pub mod multi_node;
pub mod sequential;
pub mod task_parallel;

use crate::fmm::types::{CellRefTables, SendPtrMut};
use crate::tree::morton::MortonIndex;
use crate::tree::types::CellSymbolic;

// Kernel clone of the calling worker thread.
//
// Sound because parallel work runs on the rayon pool, thread indices are
// unique within the pool, and one clone exists per pool thread; the main
// thread (no index) shares clone 0 only outside parallel sections.
pub(crate) fn worker_kernel<K>(kernel_ptrs: &[SendPtrMut<K>]) -> &mut K {
    let index = rayon::current_thread_index().unwrap_or(0);
    unsafe { &mut *kernel_ptrs[index].raw }
}

// Child multipole views of a parent cell, octant order.
pub(crate) fn gather_child_multipoles<'t, M, L>(
    cells: &'t CellRefTables<M, L>,
    child_level: usize,
    parent: MortonIndex,
) -> [Option<(&'t CellSymbolic, &'t M)>; 8] {
    core::array::from_fn(|octant| {
        cells.find(child_level, parent.child(octant)).map(|flat| unsafe {
            (
                &*cells.symbolics[child_level][flat].raw,
                &*cells.multipoles[child_level][flat].raw,
            )
        })
    })
}

// Mutable child local views of a parent cell, octant order.
pub(crate) fn gather_child_locals<'t, M, L>(
    cells: &'t CellRefTables<M, L>,
    child_level: usize,
    parent: MortonIndex,
) -> [Option<(&'t CellSymbolic, &'t mut L)>; 8] {
    core::array::from_fn(|octant| {
        cells.find(child_level, parent.child(octant)).map(|flat| {
            let symbolic = cells.symbolics[child_level][flat].raw;
            let local = cells.locals[child_level][flat].raw;
            unsafe { (&*symbolic, &mut *local) }
        })
    })
}
