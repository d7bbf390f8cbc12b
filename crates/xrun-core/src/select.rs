use crate::error::{Result, XrunError};

// Parses an index selection in batch-array syntax: `0,2,4`, `0-4:2`, or a
// mix such as `0-4:2,5`. Range stops are inclusive.
pub fn parse_indices(selection: &str) -> Result<Vec<usize>> {
    let invalid = || XrunError::InvalidSelection(selection.to_string());
    let number = |s: &str| s.trim().parse::<usize>().map_err(|_| invalid());
    let mut indices = Vec::new();
    for part in selection.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid());
        }
        if let Some((range, step)) = part.split_once(':') {
            let (start, stop) = range.split_once('-').ok_or_else(invalid)?;
            let step = number(step)?;
            push_range(&mut indices, number(start)?, number(stop)?, step).ok_or_else(invalid)?;
        } else if let Some((start, stop)) = part.split_once('-') {
            push_range(&mut indices, number(start)?, number(stop)?, 1).ok_or_else(invalid)?;
        } else {
            indices.push(number(part)?);
        }
    }
    Ok(indices)
}

fn push_range(out: &mut Vec<usize>, start: usize, stop: usize, step: usize) -> Option<()> {
    if step == 0 || stop < start {
        return None;
    }
    out.extend((start..=stop).step_by(step));
    Some(())
}
