use crate::model::Slot;

// ── Availability ──────────────────────────────────────────────────
//
// Both helpers work on slots of a single date, sorted by `start`.

/// Merge sorted overlapping/adjacent slots into disjoint slots.
pub fn merge_overlapping(sorted: &[Slot]) -> Vec<Slot> {
    let mut merged: Vec<Slot> = Vec::new();
    for &slot in sorted {
        if let Some(last) = merged.last_mut()
            && slot.date == last.date
            && slot.start <= last.end
        {
            last.end = last.end.max(slot.end);
            continue;
        }
        merged.push(slot);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `base` disjoint.
pub fn subtract_slots(base: &[Slot], to_remove: &[Slot]) -> Vec<Slot> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Slot::new(b.date, current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Slot::new(b.date, current_start, b.end));
        }
    }

    result
}
