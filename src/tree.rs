// tree.rs - Dotted-path data tree shared by parsers and serializers
//
// Keys take the form `a.b.c[3].d`: dot-separated attribute names, with
// `[N]` indexing into sequences.  Attribute names that merely look numeric
// are ordinary map keys; only the bracket syntax creates sequence entries.
// Intermediate containers are created on demand when writing.

use std::collections::BTreeMap;
use std::fmt;

/// A scalar stored at a tree leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Real(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(Value),
    Map(BTreeMap<String, Node>),
    List(Vec<Node>),
}

impl Node {
    fn empty_map() -> Node {
        Node::Map(BTreeMap::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Comp {
    Key(String),
    Idx(usize),
}

/// Split a dotted path into its components.  `item[1].length` yields
/// `Key("item"), Idx(1), Key("length")`.
fn components(path: &str) -> Vec<Comp> {
    let mut out = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        let (key, rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            out.push(Comp::Key(key.to_string()));
        }
        let mut rest = rest;
        while let Some(close) = rest.find(']') {
            if let Ok(idx) = rest[1..close].parse::<usize>() {
                out.push(Comp::Idx(idx));
            }
            rest = &rest[close + 1..];
            if !rest.starts_with('[') {
                break;
            }
        }
    }
    out
}

/// Hierarchical key/value store addressed by dotted paths.  Serves as the
/// destination of parser side effects and as the introspection snapshot
/// format; the `version` counter advances on every mutation so observers can
/// cheaply detect change.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    root: BTreeMap<String, Node>,
    version: u64,
}

impl Tree {
    pub fn new() -> Tree {
        Tree::default()
    }

    /// Monotonic mutation counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Store `value` at `path`, creating intermediate containers as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        let comps = components(path);
        let first = match comps.first() {
            Some(Comp::Key(k)) => k.clone(),
            _ => return,
        };
        self.version += 1;
        let mut node = self.root.entry(first).or_insert_with(Node::empty_map);
        for comp in &comps[1..] {
            node = Self::child(node, comp);
        }
        *node = Node::Leaf(value);
    }

    /// Descend one component, converting the node to the required container
    /// kind and extending sequences as needed.
    fn child<'a>(node: &'a mut Node, comp: &Comp) -> &'a mut Node {
        match comp {
            Comp::Key(k) => {
                if !matches!(node, Node::Map(_)) {
                    *node = Node::empty_map();
                }
                match node {
                    Node::Map(map) => map.entry(k.clone()).or_insert_with(Node::empty_map),
                    _ => unreachable!(),
                }
            }
            Comp::Idx(i) => {
                if !matches!(node, Node::List(_)) {
                    *node = Node::List(Vec::new());
                }
                match node {
                    Node::List(list) => {
                        while list.len() <= *i {
                            list.push(Node::empty_map());
                        }
                        &mut list[*i]
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    fn descend<'a>(&'a self, path: &str) -> Option<&'a Node> {
        let comps = components(path);
        let mut comps = comps.iter();
        let mut node = match comps.next()? {
            Comp::Key(k) => self.root.get(k)?,
            Comp::Idx(_) => return None,
        };
        for comp in comps {
            node = match (node, comp) {
                (Node::Map(map), Comp::Key(k)) => map.get(k)?,
                (Node::List(list), Comp::Idx(i)) => list.get(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Fetch the scalar at `path`, if one is stored there.
    pub fn get(&self, path: &str) -> Option<&Value> {
        match self.descend(path)? {
            Node::Leaf(v) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.descend(path).is_some()
    }

    /// Number of elements in the list at `path`, if a list is stored there.
    pub fn list_len(&self, path: &str) -> Option<usize> {
        match self.descend(path)? {
            Node::List(l) => Some(l.len()),
            _ => None,
        }
    }

    /// Store `value` at `path` only if nothing is there yet; returns the
    /// value now present.
    pub fn setdefault(&mut self, path: &str, value: Value) -> Value {
        if let Some(existing) = self.get(path) {
            return existing.clone();
        }
        self.set(path, value.clone());
        value
    }

    /// Merge every leaf of `other` into this tree.
    pub fn update(&mut self, other: &Tree) {
        for (path, value) in other.leaves() {
            self.set(&path, value.clone());
        }
    }

    /// Clone the subtree under `prefix` into a new tree rooted at "".
    pub fn subtree(&self, prefix: &str) -> Tree {
        let mut out = Tree::new();
        let pfx = format!("{}.", prefix);
        for (path, value) in self.leaves() {
            if let Some(rest) = path.strip_prefix(&pfx) {
                out.set(rest, value.clone());
            } else if path == prefix {
                out.set("value", value.clone());
            }
        }
        out
    }

    /// All `(dotted-path, value)` pairs, in sorted path order.
    pub fn leaves(&self) -> Vec<(String, &Value)> {
        let mut out = Vec::new();
        for (key, node) in &self.root {
            Self::walk(key, node, &mut out);
        }
        out
    }

    fn walk<'a>(path: &str, node: &'a Node, out: &mut Vec<(String, &'a Value)>) {
        match node {
            Node::Leaf(v) => out.push((path.to_string(), v)),
            Node::Map(map) => {
                for (k, child) in map {
                    Self::walk(&format!("{}.{}", path, k), child, out);
                }
            }
            Node::List(list) => {
                for (i, child) in list.iter().enumerate() {
                    Self::walk(&format!("{}[{}]", path, i), child, out);
                }
            }
        }
    }

    /// Render as JSON for the introspection surface.
    pub fn to_json(&self) -> serde_json::Value {
        fn conv(node: &Node) -> serde_json::Value {
            match node {
                Node::Leaf(Value::Bool(b)) => serde_json::Value::Bool(*b),
                Node::Leaf(Value::Int(i)) => serde_json::json!(i),
                Node::Leaf(Value::Uint(u)) => serde_json::json!(u),
                Node::Leaf(Value::Real(r)) => serde_json::json!(r),
                Node::Leaf(Value::Str(s)) => serde_json::Value::String(s.clone()),
                Node::Leaf(Value::Bytes(b)) => {
                    serde_json::json!(b.iter().map(|x| *x as u64).collect::<Vec<_>>())
                }
                Node::Map(map) => serde_json::Value::Object(
                    map.iter().map(|(k, v)| (k.clone(), conv(v))).collect(),
                ),
                Node::List(list) => {
                    serde_json::Value::Array(list.iter().map(conv).collect())
                }
            }
        }
        serde_json::Value::Object(self.root.iter().map(|(k, v)| (k.clone(), conv(v))).collect())
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (path, value) in self.leaves() {
            writeln!(f, "{:<48} {:?}", path, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_nested() {
        let mut t = Tree::new();
        t.set("enip.CIP.send_data.interface", Value::Uint(0));
        t.set("enip.CIP.send_data.CPF.item[1].type_id", Value::Uint(0x00B2));
        assert_eq!(t.get("enip.CIP.send_data.interface"), Some(&Value::Uint(0)));
        assert_eq!(
            t.get("enip.CIP.send_data.CPF.item[1].type_id"),
            Some(&Value::Uint(0x00B2))
        );
        assert!(t.get("enip.CIP.send_data.CPF.item[0].type_id").is_none());
    }

    #[test]
    fn test_numeric_names_are_keys_not_indices() {
        let mut t = Tree::new();
        t.set("attribute.1", Value::Uint(7));
        t.set("attribute.10", Value::Uint(8));
        assert_eq!(t.get("attribute.1"), Some(&Value::Uint(7)));
        assert_eq!(t.get("attribute.10"), Some(&Value::Uint(8)));
        assert!(t.list_len("attribute").is_none());
    }

    #[test]
    fn test_autovivified_list_extends() {
        let mut t = Tree::new();
        t.set("path.segment[2].element", Value::Uint(3));
        assert_eq!(t.list_len("path.segment"), Some(3));
    }

    #[test]
    fn test_setdefault_preserves_existing() {
        let mut t = Tree::new();
        t.set("enip.length", Value::Uint(4));
        assert_eq!(t.setdefault("enip.length", Value::Uint(9)), Value::Uint(4));
        assert_eq!(t.setdefault("enip.options", Value::Uint(0)), Value::Uint(0));
    }

    #[test]
    fn test_update_merges_leaves() {
        let mut a = Tree::new();
        a.set("enip.status", Value::Uint(0));
        a.set("enip.length", Value::Uint(4));
        let mut b = Tree::new();
        b.set("enip.length", Value::Uint(8));
        b.set("enip.options", Value::Uint(0));
        a.update(&b);
        assert_eq!(a.get("enip.status"), Some(&Value::Uint(0)));
        assert_eq!(a.get("enip.length"), Some(&Value::Uint(8)));
        assert_eq!(a.get("enip.options"), Some(&Value::Uint(0)));
    }

    #[test]
    fn test_version_advances_and_subtree_scopes() {
        let mut t = Tree::new();
        let v0 = t.version();
        t.set("a.b", Value::Int(1));
        t.set("a.c", Value::Int(2));
        t.set("x.y", Value::Int(3));
        assert!(t.version() > v0);
        let sub = t.subtree("a");
        assert_eq!(sub.get("b"), Some(&Value::Int(1)));
        assert_eq!(sub.get("c"), Some(&Value::Int(2)));
        assert!(sub.get("y").is_none());
    }
}
