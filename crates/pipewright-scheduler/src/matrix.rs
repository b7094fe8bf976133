//! Matrix expansion.

use pipewright_core::pipeline::{MatrixConfig, MatrixEntry};

/// Expand a matrix into the entries that each get their own run.
///
/// The cartesian product of the axes is built in declaration order, then
/// `exclude` combinations are removed, then each `include` either extends the
/// entries it is compatible with or is appended as a new entry.
pub fn expand_matrix(config: Option<&MatrixConfig>) -> Vec<MatrixEntry> {
    let Some(config) = config else {
        return vec![MatrixEntry::default()];
    };

    let mut entries = cartesian_product(config);

    entries.retain(|entry| {
        !config
            .exclude
            .iter()
            .any(|combination| matches_all(entry, combination))
    });

    let axis_names: Vec<&str> = config.axes.iter().map(|a| a.name.as_str()).collect();
    // Appended includes are standalone; only product entries can be extended.
    let product_len = entries.len();

    for combination in &config.include {
        let mut extended = false;
        for entry in entries.iter_mut().take(product_len) {
            // Original axis values are never overwritten by an include.
            let compatible = combination
                .iter()
                .filter(|(k, _)| axis_names.contains(&k.as_str()))
                .all(|(k, v)| entry.get(k) == Some(v.as_str()));
            if compatible {
                for (k, v) in combination {
                    if !axis_names.contains(&k.as_str()) {
                        entry.set(k.clone(), v.clone());
                    }
                }
                extended = true;
            }
        }

        if !extended {
            entries.push(MatrixEntry {
                values: combination.clone(),
            });
        }
    }

    entries
}

fn cartesian_product(config: &MatrixConfig) -> Vec<MatrixEntry> {
    if config.axes.is_empty() {
        // Only includes define entries; with none, run once.
        return if config.include.is_empty() {
            vec![MatrixEntry::default()]
        } else {
            Vec::new()
        };
    }

    let mut entries = vec![MatrixEntry::default()];
    for axis in &config.axes {
        entries = entries
            .into_iter()
            .flat_map(|entry| {
                axis.values.iter().map(move |value| {
                    let mut next = entry.clone();
                    next.set(axis.name.clone(), value.clone());
                    next
                })
            })
            .collect();
    }
    entries
}

fn matches_all(entry: &MatrixEntry, combination: &[(String, String)]) -> bool {
    combination
        .iter()
        .all(|(k, v)| entry.get(k) == Some(v.as_str()))
}
