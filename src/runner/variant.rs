//! Runner variant selection.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::accel::AcceleratorInfo;

/// Order the extracted runner variants by preference for this accelerator.
///
/// The exact requested tag comes first when present; `metal` has no useful
/// alternative so it short-circuits. For GPU libraries the remaining
/// same-family builds follow in lexicographic order, then the best CPU
/// build as a last resort. The caller tries candidates in order; running the
/// wrong CPU instructions would abort the runner process, hence the flagged
/// CPU build is only offered when it was actually extracted.
pub fn select_variants(
    info: &AcceleratorInfo,
    available: &BTreeMap<String, PathBuf>,
) -> Vec<String> {
    let requested = info.requested_tag();

    let mut variants = Vec::new();
    if available.contains_key(&requested) {
        variants.push(requested.clone());
        if requested == "metal" {
            return variants;
        }
    }

    if info.library != "cpu" {
        // BTreeMap keys iterate sorted, which keeps load order deterministic.
        for tag in available.keys() {
            if *tag != requested && tag.split('_').next() == Some(info.library.as_str()) {
                variants.push(tag.clone());
            }
        }

        let flagged = format!("cpu_{}", info.cpu_flag);
        if !info.cpu_flag.is_empty() && available.contains_key(&flagged) {
            variants.push(flagged);
        } else {
            variants.push("cpu".to_string());
        }
    }

    if variants.is_empty() {
        variants.push("cpu".to_string());
    }

    variants
}
