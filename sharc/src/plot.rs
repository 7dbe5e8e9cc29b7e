//! Graphviz serialization of symbolic heaps.
//!
//! One `.dot` file per heap: objects become clustered sub-graphs colored by
//! storage class and kind, fields become boxes, values become ellipses whose
//! pen width grows with their usage, and stored disequalities show up as
//! dashed red edges.

use crate::heap::{CustomValue, ObjId, ObjKind, StorageClass, SymHeap, ValId, VAL_NULL, VAL_TRUE};
use crate::log::*;
use crate::storage::TypeKind;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Generates unique plot filenames for one process. Passed explicitly by the
/// caller; deliberately not an ambient global.
#[derive(Default)]
pub struct PlotEnumerator {
    next: usize,
}

impl PlotEnumerator {
    pub fn new() -> Self {
        Default::default()
    }

    fn decorated(&mut self, name: &str) -> String {
        let id = self.next;
        self.next += 1;
        format!("{}-{:04}.dot", name, id)
    }
}

fn obj_colors(sh: &SymHeap, o: ObjId) -> (&'static str, f64) {
    let kind = sh.kind_of(o);
    if kind.is_abstract() {
        let color = match kind {
            ObjKind::Sls => "red",
            ObjKind::Dls => "gold",
            _ => "green",
        };
        return (color, 3.0);
    }
    let color = match sh.storage_class(o) {
        StorageClass::OnStack | StorageClass::Static => "blue",
        StorageClass::OnHeap => "black",
        _ => "red",
    };
    (color, 1.0)
}

fn custom_label(c: &CustomValue, out: &mut String) {
    match c {
        CustomValue::Int(r) => {
            if let Some(n) = r.as_singular() {
                let _ = write!(out, "fontcolor=red, label=\"[int] {}\"", n);
            } else {
                let _ = write!(out, "fontcolor=red, label=\"[int range] {}..{}\"", r.lo, r.hi);
            }
        }
        CustomValue::Real(x) => {
            let _ = write!(out, "fontcolor=red, label=\"[real] {}\"", x);
        }
        CustomValue::Fnc(uid) => {
            let _ = write!(out, "fontcolor=green, label=\"fnc{}()\"", uid);
        }
        CustomValue::Str(s) => {
            let _ = write!(out, "fontcolor=blue, label=\"\\\"{}\\\"\"", s.escape_default());
        }
    }
}

/// Render `sh` as a DOT directed graph
pub fn heap_to_dot(sh: &SymHeap, label: &str) -> String {
    let mut dot = String::new();
    let _ = writeln!(dot, "digraph \"{}\" {{", label);
    let _ = writeln!(dot, "\tlabel=<<FONT POINT-SIZE=\"18\">{}</FONT>>;", label);
    let _ = writeln!(dot, "\tclusterrank=local;");
    let _ = writeln!(dot, "\tlabelloc=t;");

    // values worth a node of their own
    let mut vals: Vec<ValId> = vec![];
    let note_val = |vals: &mut Vec<ValId>, v: ValId| {
        if !vals.contains(&v) {
            vals.push(v);
        }
    };

    for o in sh.gather_root_objs() {
        let (color, pw) = obj_colors(sh, o);
        let _ = writeln!(dot, "\tsubgraph \"cluster_{}\" {{", o.0);
        let seg_note = match sh.seg_data(o) {
            Some(seg) => format!(" {:?} {}+", sh.kind_of(o), seg.min_len),
            None => String::new(),
        };
        let var_note = match sh.prog_var_of(o) {
            Some(var) => format!(" {}", sh.stor().var_info(var).name),
            None => String::new(),
        };
        let _ = writeln!(
            dot,
            "\t\tlabel=\"#{} {:?}{}{}\";",
            o.0,
            sh.storage_class(o),
            seg_note,
            var_note
        );
        let _ = writeln!(dot, "\t\tcolor={};", color);
        let _ = writeln!(dot, "\t\tfontcolor={};", color);
        let _ = writeln!(dot, "\t\tbgcolor=gray98;");
        let _ = writeln!(dot, "\t\tstyle=dashed;");
        let _ = writeln!(dot, "\t\tpenwidth={:.1};", pw);
        let _ = writeln!(
            dot,
            "\t\t\"o{}\" [shape=plaintext, fontcolor={}, label=\"#{}\"];",
            o.0, color, o.0
        );

        for ((off, ty), v) in sh.live_fields(o) {
            let is_ptr = sh.stor().type_of(ty).kind == TypeKind::Ptr;
            let style = if is_ptr { "solid" } else { "dotted" };
            let _ = writeln!(
                dot,
                "\t\t\"f{}.{}\" [shape=box, color=black, style={}, label=\"+{}\"];",
                o.0, off, style, off
            );
            note_val(&mut vals, v);
        }
        for (off, ub) in sh.uniform_blocks(o) {
            let _ = writeln!(
                dot,
                "\t\t\"f{}.{}\" [shape=box, color=blue, fontcolor=blue, label=\"UNIFORM_BLOCK {}B\"];",
                o.0, off, ub.size
            );
            note_val(&mut vals, ub.template);
        }
        let _ = writeln!(dot, "\t}}");
    }

    for (a, b) in sh.gather_neqs() {
        note_val(&mut vals, a);
        note_val(&mut vals, b);
    }

    // value nodes
    for &v in &vals {
        if v == VAL_NULL {
            let _ = writeln!(dot, "\t\"v0\" [shape=plaintext, fontcolor=blue, label=NULL];");
            continue;
        }
        if v == VAL_TRUE {
            let _ = writeln!(dot, "\t\"v-1\" [shape=plaintext, fontcolor=gold, label=TRUE];");
            continue;
        }
        if v.0 <= 0 {
            let _ = writeln!(dot, "\t\"v{}\" [shape=plaintext, fontcolor=red, label=INVALID];", v.0);
            continue;
        }
        let pw = 1 + sh.used_by_count(v);
        let mut attrs = String::new();
        if let Some(c) = sh.custom_of(v) {
            custom_label(c, &mut attrs);
        } else if let Some((root, off)) = sh.ptr_target(v) {
            let valid = sh.valid(root);
            let color = if valid { "blue" } else { "red" };
            let off_s = off
                .as_singular()
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("{}..{}", off.lo, off.hi));
            let _ = write!(attrs, "fontcolor={}, label=\"#{}+{}\"", color, root.0, off_s);
        } else if let Some(origin) = sh.unknown_origin(v) {
            let _ = write!(attrs, "fontcolor=gray, label=\"? {:?}\"", origin);
        } else {
            let _ = write!(attrs, "label=\"v{}\"", v.0);
        }
        let _ = writeln!(dot, "\t\"v{}\" [shape=ellipse, penwidth={}, {}];", v.0, pw, attrs);
    }

    // field -> value edges; the next selector is red, the prev/peer gold
    for o in sh.gather_root_objs() {
        let seg = sh.seg_data(o);
        for ((off, _ty), v) in sh.live_fields(o) {
            let color = match seg {
                Some(seg) if off == seg.head + seg.binder.off => "red",
                Some(seg) if seg.peer.map(|p| seg.head + p.off) == Some(off) => "gold",
                _ => "black",
            };
            let _ = writeln!(dot, "\t\"f{}.{}\" -> \"v{}\" [color={}];", o.0, off, v.0, color);
        }
        for (off, ub) in sh.uniform_blocks(o) {
            let _ = writeln!(
                dot,
                "\t\"f{}.{}\" -> \"v{}\" [color=blue, style=dotted];",
                o.0, off, ub.template.0
            );
        }
    }

    // value -> pointee edges
    for &v in &vals {
        if let Some((root, _)) = sh.ptr_target(v) {
            if sh.valid(root) {
                let _ = writeln!(dot, "\t\"v{}\" -> \"o{}\" [color=blue];", v.0, root.0);
            }
        }
    }

    // disequalities
    for (a, b) in sh.gather_neqs() {
        let _ = writeln!(
            dot,
            "\t\"v{}\" -> \"v{}\" [color=red, fontcolor=gold, label=neq, style=dashed, \
             penwidth=2.0, arrowhead=none];",
            a.0, b.0
        );
    }

    let _ = writeln!(dot, "}}");
    dot
}

/// Serialize `sh` into `<dir>/<name>-NNNN.dot`, numbering the file through
/// the caller's enumerator. Returns the path written.
pub fn plot_heap(
    sh: &SymHeap,
    name: &str,
    pe: &mut PlotEnumerator,
    dir: &Path,
) -> std::io::Result<PathBuf> {
    let path = dir.join(pe.decorated(name));
    let dot = heap_to_dot(sh, name);
    std::fs::write(&path, dot)?;
    debug!("wrote a heap plot"; "path" => %path.display());
    Ok(path)
}
