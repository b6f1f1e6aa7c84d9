// automata/regex.rs - Conventional pattern syntax compiled to a minimized DFA
//
// Supports alternation, concatenation, Kleene star/plus, optional, character
// classes (ranges and negation), '.', escapes, and (no-op) anchors.  The
// pipeline is the classic one: pattern -> AST -> Thompson NFA -> subset
// construction -> partition refinement -> dead-state pruning.  Only states
// corresponding to accepting NFA configurations carry terminal=true in the
// produced machine.

use super::{Automaton, Builder, Config, Emit};
use crate::error::{EnipError, Result};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
enum Ast {
    Empty,
    Literal(u8),
    Class { negated: bool, ranges: Vec<(u8, u8)> },
    Concat(Vec<Ast>),
    Alt(Vec<Ast>),
    Star(Box<Ast>),
    Plus(Box<Ast>),
    Opt(Box<Ast>),
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(pattern: &'a str) -> Parser<'a> {
        Parser { bytes: pattern.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn parse(&mut self) -> Result<Ast> {
        let ast = self.alternation()?;
        if self.pos != self.bytes.len() {
            return Err(EnipError::Protocol(format!(
                "unexpected '{}' at offset {} in pattern",
                self.bytes[self.pos] as char, self.pos
            )));
        }
        Ok(ast)
    }

    fn alternation(&mut self) -> Result<Ast> {
        let mut arms = vec![self.concatenation()?];
        while self.peek() == Some(b'|') {
            self.bump();
            arms.push(self.concatenation()?);
        }
        Ok(if arms.len() == 1 { arms.pop().unwrap() } else { Ast::Alt(arms) })
    }

    fn concatenation(&mut self) -> Result<Ast> {
        let mut parts = Vec::new();
        while let Some(b) = self.peek() {
            if b == b'|' || b == b')' {
                break;
            }
            parts.push(self.repetition()?);
        }
        Ok(match parts.len() {
            0 => Ast::Empty,
            1 => parts.pop().unwrap(),
            _ => Ast::Concat(parts),
        })
    }

    fn repetition(&mut self) -> Result<Ast> {
        let mut atom = self.atom()?;
        while let Some(b) = self.peek() {
            atom = match b {
                b'*' => Ast::Star(Box::new(atom)),
                b'+' => Ast::Plus(Box::new(atom)),
                b'?' => Ast::Opt(Box::new(atom)),
                _ => break,
            };
            self.bump();
        }
        Ok(atom)
    }

    fn atom(&mut self) -> Result<Ast> {
        match self.bump() {
            None => Err(EnipError::Protocol("pattern ended unexpectedly".into())),
            Some(b'(') => {
                let inner = self.alternation()?;
                match self.bump() {
                    Some(b')') => Ok(inner),
                    _ => Err(EnipError::Protocol("unbalanced '(' in pattern".into())),
                }
            }
            Some(b'[') => self.class(),
            Some(b'.') => Ok(Ast::Class { negated: true, ranges: vec![] }),
            Some(b'\\') => self.escape(),
            // Anchors are no-ops: machines are anchored by construction
            Some(b'^') | Some(b'$') => Ok(Ast::Empty),
            Some(b) => Ok(Ast::Literal(b)),
        }
    }

    fn escape(&mut self) -> Result<Ast> {
        let b = self
            .bump()
            .ok_or_else(|| EnipError::Protocol("dangling escape in pattern".into()))?;
        Ok(match b {
            b'd' => Ast::Class { negated: false, ranges: vec![(b'0', b'9')] },
            b'w' => Ast::Class {
                negated: false,
                ranges: vec![(b'0', b'9'), (b'A', b'Z'), (b'a', b'z'), (b'_', b'_')],
            },
            b's' => Ast::Class {
                negated: false,
                ranges: vec![(b' ', b' '), (b'\t', b'\t'), (b'\r', b'\r'), (b'\n', b'\n')],
            },
            b'n' => Ast::Literal(b'\n'),
            b'r' => Ast::Literal(b'\r'),
            b't' => Ast::Literal(b'\t'),
            b'0' => Ast::Literal(0),
            b'x' => {
                let hi = self.hex_digit()?;
                let lo = self.hex_digit()?;
                Ast::Literal(hi * 16 + lo)
            }
            other => Ast::Literal(other),
        })
    }

    fn hex_digit(&mut self) -> Result<u8> {
        let b = self
            .bump()
            .ok_or_else(|| EnipError::Protocol("truncated \\x escape in pattern".into()))?;
        (b as char)
            .to_digit(16)
            .map(|d| d as u8)
            .ok_or_else(|| EnipError::Protocol("invalid \\x escape in pattern".into()))
    }

    fn class(&mut self) -> Result<Ast> {
        let negated = if self.peek() == Some(b'^') {
            self.bump();
            true
        } else {
            false
        };
        let mut ranges = Vec::new();
        loop {
            let b = match self.bump() {
                None => return Err(EnipError::Protocol("unterminated '[' class".into())),
                Some(b']') => break,
                Some(b'\\') => match self.escape()? {
                    Ast::Literal(l) => l,
                    Ast::Class { ranges: sub, .. } => {
                        ranges.extend(sub);
                        continue;
                    }
                    _ => return Err(EnipError::Protocol("bad escape in class".into())),
                },
                Some(b) => b,
            };
            if self.peek() == Some(b'-') && self.bytes.get(self.pos + 1) != Some(&b']') {
                self.bump();
                let hi = match self.bump() {
                    Some(b'\\') => match self.escape()? {
                        Ast::Literal(l) => l,
                        _ => return Err(EnipError::Protocol("bad range bound in class".into())),
                    },
                    Some(hi) => hi,
                    None => return Err(EnipError::Protocol("unterminated range in class".into())),
                };
                ranges.push((b.min(hi), b.max(hi)));
            } else {
                ranges.push((b, b));
            }
        }
        Ok(Ast::Class { negated, ranges })
    }
}

fn class_contains(negated: bool, ranges: &[(u8, u8)], b: u8) -> bool {
    let inside = ranges.iter().any(|&(lo, hi)| lo <= b && b <= hi);
    inside != negated
}

// Thompson NFA.  Each state has epsilon successors and at most one symbol
// transition (a class) per construction.

#[derive(Default)]
struct Nfa {
    eps: Vec<Vec<usize>>,
    trans: Vec<Option<(bool, Vec<(u8, u8)>, usize)>>,
}

impl Nfa {
    fn add(&mut self) -> usize {
        self.eps.push(Vec::new());
        self.trans.push(None);
        self.eps.len() - 1
    }

    /// Returns (start, end) of the fragment for `ast`.
    fn fragment(&mut self, ast: &Ast) -> (usize, usize) {
        match ast {
            Ast::Empty => {
                let s = self.add();
                (s, s)
            }
            Ast::Literal(b) => {
                let s = self.add();
                let e = self.add();
                self.trans[s] = Some((false, vec![(*b, *b)], e));
                (s, e)
            }
            Ast::Class { negated, ranges } => {
                let s = self.add();
                let e = self.add();
                self.trans[s] = Some((*negated, ranges.clone(), e));
                (s, e)
            }
            Ast::Concat(parts) => {
                let mut start = None;
                let mut prev_end: Option<usize> = None;
                for p in parts {
                    let (s, e) = self.fragment(p);
                    if let Some(pe) = prev_end {
                        self.eps[pe].push(s);
                    } else {
                        start = Some(s);
                    }
                    prev_end = Some(e);
                }
                (start.unwrap(), prev_end.unwrap())
            }
            Ast::Alt(arms) => {
                let s = self.add();
                let e = self.add();
                for a in arms {
                    let (as_, ae) = self.fragment(a);
                    self.eps[s].push(as_);
                    self.eps[ae].push(e);
                }
                (s, e)
            }
            Ast::Star(inner) => {
                let s = self.add();
                let e = self.add();
                let (is, ie) = self.fragment(inner);
                self.eps[s].push(is);
                self.eps[s].push(e);
                self.eps[ie].push(is);
                self.eps[ie].push(e);
                (s, e)
            }
            Ast::Plus(inner) => {
                let (is, ie) = self.fragment(inner);
                let e = self.add();
                self.eps[ie].push(is);
                self.eps[ie].push(e);
                (is, e)
            }
            Ast::Opt(inner) => {
                let s = self.add();
                let e = self.add();
                let (is, ie) = self.fragment(inner);
                self.eps[s].push(is);
                self.eps[s].push(e);
                self.eps[ie].push(e);
                (s, e)
            }
        }
    }

    fn closure(&self, set: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut out = set.clone();
        let mut work: Vec<usize> = set.iter().copied().collect();
        while let Some(s) = work.pop() {
            for &t in &self.eps[s] {
                if out.insert(t) {
                    work.push(t);
                }
            }
        }
        out
    }

    fn step(&self, set: &BTreeSet<usize>, b: u8) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for &s in set {
            if let Some((neg, ranges, to)) = &self.trans[s] {
                if class_contains(*neg, ranges, b) {
                    out.insert(*to);
                }
            }
        }
        self.closure(&out)
    }
}

/// A compiled pattern: the minimized transition table, directly runnable and
/// convertible into an `Automaton` for composition.
#[derive(Debug, Clone)]
pub struct Pattern {
    start: usize,
    accepting: Vec<bool>,
    /// `table[state][byte]` -> successor, if the byte is acceptable there
    table: Vec<Vec<Option<usize>>>,
}

impl Pattern {
    pub fn compile(pattern: &str) -> Result<Pattern> {
        let ast = Parser::new(pattern).parse()?;
        let mut nfa = Nfa::default();
        let (start, accept) = nfa.fragment(&ast);

        // Subset construction
        let mut ids: BTreeMap<BTreeSet<usize>, usize> = BTreeMap::new();
        let start_set = nfa.closure(&BTreeSet::from([start]));
        ids.insert(start_set.clone(), 0);
        let mut sets = vec![start_set];
        let mut table: Vec<Vec<Option<usize>>> = Vec::new();
        let mut accepting = Vec::new();
        let mut i = 0;
        while i < sets.len() {
            let set = sets[i].clone();
            accepting.push(set.contains(&accept));
            let mut row = vec![None; 256];
            for b in 0..=255u8 {
                let next = nfa.step(&set, b);
                if next.is_empty() {
                    continue;
                }
                let id = *ids.entry(next.clone()).or_insert_with(|| {
                    sets.push(next);
                    sets.len() - 1
                });
                row[b as usize] = Some(id);
            }
            table.push(row);
            i += 1;
        }

        let (start, accepting, table) = minimize(0, &accepting, &table);
        Ok(Pattern { start, accepting, table })
    }

    /// Whether the whole input is accepted.
    pub fn matches(&self, input: &[u8]) -> bool {
        let mut state = self.start;
        for &b in input {
            state = match self.table[state][b as usize] {
                Some(next) => next,
                None => return false,
            };
        }
        self.accepting[state]
    }

    /// Convert into a machine for composition: one state per DFA state, with
    /// accepting states terminal.  `store` selects whether matched bytes are
    /// kept (emitted as an ISO-8859-1 string at `context`) or discarded.
    pub fn into_automaton(&self, name: &str, context: &str, greedy: bool, store: bool) -> Automaton {
        let mut b = Builder::new(name);
        let ids: Vec<_> = (0..self.table.len())
            .map(|i| {
                let nm = format!("s{}", i);
                if store {
                    b.input(&nm)
                } else {
                    b.discard(&nm)
                }
            })
            .collect();
        for (i, row) in self.table.iter().enumerate() {
            if self.accepting[i] {
                b.terminal(ids[i]);
            }
            for (byte, target) in row.iter().enumerate() {
                if let Some(t) = target {
                    b.on(ids[i], byte as u8, ids[*t]);
                }
            }
        }
        b.build(
            ids[self.start],
            Config {
                context: context.to_string(),
                greedy,
                terminal: true,
                repeat: None,
                emit: if store { Some(Emit::Str) } else { None },
            },
        )
    }
}

/// Moore partition refinement over the (implicitly completed) DFA, followed
/// by removal of states that cannot reach an accepting state.
fn minimize(
    start: usize,
    accepting: &[bool],
    table: &[Vec<Option<usize>>],
) -> (usize, Vec<bool>, Vec<Vec<Option<usize>>>) {
    let n = table.len();
    let dead = n; // implicit sink for missing transitions
    let total = n + 1;
    let succ = |s: usize, b: usize| -> usize {
        if s == dead {
            dead
        } else {
            table[s][b].unwrap_or(dead)
        }
    };

    // Initial partition: accepting vs not
    let mut class = vec![0usize; total];
    for (s, c) in class.iter_mut().enumerate().take(n) {
        *c = if accepting[s] { 1 } else { 0 };
    }
    class[dead] = 0;
    loop {
        // Signature of a state: (its class, classes of its 256 successors)
        let mut sig_ids: BTreeMap<(usize, Vec<usize>), usize> = BTreeMap::new();
        let mut next_class = vec![0usize; total];
        for s in 0..total {
            let sig = (class[s], (0..256).map(|b| class[succ(s, b)]).collect::<Vec<_>>());
            let id = sig_ids.len();
            let id = *sig_ids.entry(sig).or_insert(id);
            next_class[s] = id;
        }
        if next_class == class {
            break;
        }
        class = next_class;
    }

    // Representative per class; the dead state's class is dropped by making
    // transitions into it None, unless the dead class also contains live
    // accepting-reachable states (it cannot, by refinement).
    let dead_class = class[dead];
    let class_count = class.iter().max().unwrap() + 1;
    let mut new_table = vec![vec![None; 256]; class_count];
    let mut new_accepting = vec![false; class_count];
    for s in 0..n {
        let c = class[s];
        new_accepting[c] = accepting[s];
        for b in 0..256 {
            let t = class[succ(s, b)];
            if t != dead_class {
                new_table[c][b] = Some(t);
            }
        }
    }

    // Prune classes that cannot reach an accepting class
    let mut reaches = new_accepting.clone();
    loop {
        let mut changed = false;
        for c in 0..class_count {
            if reaches[c] {
                continue;
            }
            if new_table[c].iter().flatten().any(|&t| reaches[t]) {
                reaches[c] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    for row in new_table.iter_mut() {
        for cell in row.iter_mut() {
            if let Some(t) = *cell {
                if !reaches[t] {
                    *cell = None;
                }
            }
        }
    }

    // Compact away unreferenced classes (dead class and unreachable ones)
    let mut remap = vec![None; class_count];
    let mut order = Vec::new();
    let mut stack = vec![class[start]];
    while let Some(c) = stack.pop() {
        if remap[c].is_some() {
            continue;
        }
        remap[c] = Some(order.len());
        order.push(c);
        for t in new_table[c].iter().flatten() {
            if remap[*t].is_none() {
                stack.push(*t);
            }
        }
    }
    let mut final_table = Vec::with_capacity(order.len());
    let mut final_accepting = Vec::with_capacity(order.len());
    for &c in &order {
        final_accepting.push(new_accepting[c]);
        final_table.push(
            new_table[c]
                .iter()
                .map(|cell| cell.and_then(|t| remap[t]))
                .collect(),
        );
    }
    (0, final_accepting, final_table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepts(pattern: &str, input: &[u8]) -> bool {
        Pattern::compile(pattern).unwrap().matches(input)
    }

    #[test]
    fn test_literals_and_concat() {
        assert!(accepts("abc", b"abc"));
        assert!(!accepts("abc", b"ab"));
        assert!(!accepts("abc", b"abcd"));
    }

    #[test]
    fn test_alternation_and_groups() {
        assert!(accepts("ab|cd", b"ab"));
        assert!(accepts("ab|cd", b"cd"));
        assert!(!accepts("ab|cd", b"ad"));
        assert!(accepts("a(b|c)d", b"abd"));
        assert!(accepts("a(b|c)d", b"acd"));
    }

    #[test]
    fn test_repetition() {
        assert!(accepts("a*", b""));
        assert!(accepts("a*", b"aaaa"));
        assert!(accepts("a+", b"a"));
        assert!(!accepts("a+", b""));
        assert!(accepts("ab?c", b"ac"));
        assert!(accepts("ab?c", b"abc"));
    }

    #[test]
    fn test_classes() {
        assert!(accepts("[a-z]+", b"hello"));
        assert!(!accepts("[a-z]+", b"Hello"));
        assert!(accepts("[^\\x00]*", b"Communications"));
        assert!(!accepts("[^\\x00]*", b"Comm\0"));
        assert!(accepts("\\d\\d", b"42"));
        assert!(accepts("\\w+", b"SCADA_40001"));
    }

    #[test]
    fn test_anchors_are_inert() {
        assert!(accepts("^abc$", b"abc"));
    }

    #[test]
    fn test_minimized_dfa_agrees_with_table() {
        // compile(pattern) run as an Automaton accepts exactly the strings
        // the direct table run accepts
        let pattern = "(ab)+|a*c?";
        let compiled = Pattern::compile(pattern).unwrap();
        let machine = compiled.into_automaton("re", "m", true, false);
        for input in [
            &b""[..], b"a", b"ab", b"abab", b"aab", b"aaac", b"c", b"abc", b"ba",
        ] {
            assert_eq!(
                machine.matches(input),
                compiled.matches(input),
                "disagreement on {:?}",
                input
            );
        }
    }

    #[test]
    fn test_only_accepting_states_terminal() {
        let compiled = Pattern::compile("ab").unwrap();
        // "a" leads to a live, non-accepting state: full-match must fail
        assert!(!compiled.matches(b"a"));
        let machine = compiled.into_automaton("re", "m", true, false);
        assert!(!machine.matches(b"a"));
        assert!(machine.matches(b"ab"));
    }
}
