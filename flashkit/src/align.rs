// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Check if the offset is a multiple of the alignment.
pub fn is_aligned<N: PrimInt>(offset: N, alignment: N) -> bool {
    offset % alignment == N::zero()
}

/// Round down to the previous multiple of the alignment.
pub fn align_down<N: PrimInt>(offset: N, alignment: N) -> N {
    offset - offset % alignment
}

/// Round up to the next multiple of the alignment.
pub fn align_up<N: PrimInt>(offset: N, alignment: N) -> Option<N> {
    let r = offset % alignment;
    if r == N::zero() {
        Some(offset)
    } else {
        offset.checked_add(&(alignment - r))
    }
}
