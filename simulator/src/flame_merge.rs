use prelude::flame::{self, Span};
use std::fs::File;
use std::io;
use std::mem;
use std::path::Path;

/// Writes the recorded spans as an html flame graph and logs the time spent per span name,
/// with repeated spans merged.
pub fn write_flame(path: &Path) -> io::Result<()> {
    let mut spans = flame::spans();
    flame::dump_html(&mut File::create(path)?)?;

    merge_spans(&mut spans);
    for line in summary(&spans) {
        info!("{}", line);
    }
    Ok(())
}

/// One line per merged span, indented by depth, with the total time in milliseconds.
fn summary(spans: &[Span]) -> Vec<String> {
    let mut lines = Vec::new();
    for span in spans {
        lines.push(format!(
            "{:indent$}{}: {:.3} ms",
            "",
            span.name,
            span.delta as f64 / 1e6,
            indent = 2 * span.depth as usize
        ));
        lines.extend(summary(&span.children));
    }
    lines
}

fn merge_spans(spans: &mut Vec<Span>) {
    if spans.is_empty() {
        return;
    }

    // Spans to be merged end up adjacent, those with the most children first
    spans.sort_unstable_by(|s1, s2| {
        let a = (&s1.name, s1.depth, usize::MAX - s1.children.len());
        let b = (&s2.name, s2.depth, usize::MAX - s2.children.len());
        a.cmp(&b)
    });

    let mut merge_targets = vec![0];
    for i in 1..spans.len() {
        let target = merge_targets[merge_targets.len() - 1];
        if spans[target].name == spans[i].name && spans[target].depth == spans[i].depth {
            let delta = spans[i].delta;
            let children = mem::take(&mut spans[i].children);
            spans[target].delta += delta;
            spans[target].children.extend(children);
        } else {
            merge_targets.push(i);
        }
    }

    for (target_i, &current_i) in merge_targets.iter().enumerate() {
        spans.swap(target_i, current_i);
    }
    spans.truncate(merge_targets.len());

    for span in spans {
        merge_spans(&mut span.children);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_spans_collapse() {
        for _ in 0..3 {
            let _outer = flame::start_guard("merge outer");
            let _inner = flame::start_guard("merge inner");
        }
        let mut spans = flame::spans();
        let before: usize = spans.iter().filter(|s| s.name == "merge outer").count();
        assert_eq!(before, 3);

        merge_spans(&mut spans);
        let outer: Vec<&Span> = spans.iter().filter(|s| s.name == "merge outer").collect();
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].children.len(), 1);

        let lines = summary(std::slice::from_ref(outer[0]));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("merge outer: "));
        assert!(lines[1].starts_with("  merge inner: "));
        flame::clear();
    }
}
