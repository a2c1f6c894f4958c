//! Excluded-region lookup for C callers.

use std::ffi::{CStr, c_char};

use gpublas_membrane::ExcludedRegions;

/// One `[start, end)` range.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpublasRegion {
    pub start: usize,
    pub end: usize,
}

/// Returned when `patterns` is null with a non-zero `count`, or a pattern is
/// not UTF-8. Map read and parse failures use `RegionError::code`.
pub const GPUBLAS_EINVAL: isize = -22;

/// Scan `/proc/self/maps` for mappings whose path contains any of
/// the `count` NUL-terminated `patterns`. Writes up to `capacity` regions to
/// `out` and returns how many were found in total (which may exceed
/// `capacity`), or a negative code.
///
/// # Safety
///
/// `patterns` must point to `count` valid C strings; `out` must be null or
/// writable for `capacity` regions.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn gpublas_find_excluded_regions(
    patterns: *const *const c_char,
    count: usize,
    out: *mut GpublasRegion,
    capacity: usize,
) -> isize {
    if patterns.is_null() && count > 0 {
        return GPUBLAS_EINVAL;
    }
    let mut owned = Vec::with_capacity(count);
    for i in 0..count {
        // SAFETY: caller vouches for `count` entries.
        let raw = unsafe { *patterns.add(i) };
        if raw.is_null() {
            return GPUBLAS_EINVAL;
        }
        // SAFETY: caller vouches each entry is a valid C string.
        match unsafe { CStr::from_ptr(raw) }.to_str() {
            Ok(text) => owned.push(text.to_string()),
            Err(_) => return GPUBLAS_EINVAL,
        }
    }

    let regions = match ExcludedRegions::scan(owned.as_slice()) {
        Ok(regions) => regions,
        Err(err) => return err.code() as isize,
    };
    if !out.is_null() {
        for (i, region) in regions.regions().iter().take(capacity).enumerate() {
            // SAFETY: `i < capacity` and caller vouches `out` holds `capacity`.
            unsafe {
                out.add(i).write(GpublasRegion {
                    start: region.start,
                    end: region.end,
                });
            }
        }
    }
    regions.len() as isize
}
