// automata/mod.rs - Composable deterministic state machine runtime
//
// Every parser in this crate is ultimately a machine of labelled states run
// over a lazy byte source.  A machine owns an arena of states; a state may
// itself embed a whole sub-machine, and the runner keeps an explicit frame
// stack so that a symbol unmatched by an inner machine is offered to each
// enclosing machine in turn (the enclosing-machine fallback).  The frame
// stack stands in for parent pointers; no ownership cycles exist.
//
// Consumption rules: a state's consumption policy applies to the symbol that
// caused each transition into it.  A machine's initial state is entered
// without input.  Epsilon transitions never touch the source.  A symbol for
// which no machine on the stack has a transition never advances the source.

pub mod regex;

use crate::error::{EnipError, Result};
use crate::tree::{Tree, Value};
use std::collections::VecDeque;
use std::sync::Arc;

pub type StateId = usize;

/// What entering a state does with the symbol that drove the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    /// Leave the symbol for the next transition to examine
    None,
    /// Consume and append to the machine's collected bytes
    Store,
    /// Consume and discard
    Discard,
}

/// Post-transition side effect, applied after any consumption.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write `true` at the given tree path (used to record that an empty
    /// production, eg. an UnregisterSession body, was recognized)
    Mark(String),
}

/// How a machine's collected bytes are written into the tree when the
/// machine completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    /// Raw bytes at the machine context
    Bytes,
    /// Little-endian unsigned integer (width = collected length)
    Uint,
    /// Little-endian signed integer
    Int,
    /// IEEE-754 little-endian float (4 or 8 bytes)
    Real,
    /// ISO-8859-1 string
    Str,
}

/// Number of times a machine's state graph runs to terminal before the
/// machine itself completes.
#[derive(Debug, Clone)]
pub enum Repeat {
    Fixed(usize),
    /// Count read from the parse tree when the machine is entered
    Path(String),
}

#[derive(Debug, Clone)]
enum Kind {
    Plain,
    Sub(Box<Automaton>),
}

#[derive(Debug, Clone)]
pub struct State {
    name: String,
    terminal: bool,
    consume: Consume,
    action: Option<Action>,
    kind: Kind,
    edges: Vec<(u8, StateId)>,
    epsilon: Option<StateId>,
    default: Option<StateId>,
}

/// A machine: an arena of states, an initial state, and the flags governing
/// how it runs and how its result lands in the parse tree.
#[derive(Debug, Clone)]
pub struct Automaton {
    pub name: String,
    states: Vec<State>,
    initial: StateId,
    /// Absolute tree path this machine's emit (and sub-machine contexts)
    /// write beneath
    pub context: String,
    pub greedy: bool,
    pub terminal: bool,
    repeat: Option<Repeat>,
    emit: Option<Emit>,
}

impl Automaton {
    /// Convenience full-match: runs a fresh machine over `input` with EOF
    /// signalled, and reports whether the whole input was accepted.
    pub fn matches(&self, input: &[u8]) -> bool {
        let mut runner = Runner::new(Arc::new(self.clone()));
        let mut source = Source::from(input);
        let mut tree = Tree::new();
        matches!(runner.run(&mut source, &mut tree, true), Ok(Outcome::Complete))
            && runner.terminal()
            && source.peek().is_none()
    }
}

/// Cheaply cloneable machine handle; machines are immutable once built, so a
/// single description can drive any number of concurrent runners.
pub type ArcAutomaton = Arc<Automaton>;

/// Lazy byte sequence with one-symbol lookahead, position tracking, and
/// prepending of un-consumed symbols.  More input may be chained on at any
/// time, which is how partial TCP segments are fed through a parse in
/// progress.
#[derive(Debug, Default)]
pub struct Source {
    buf: VecDeque<u8>,
    sent: usize,
}

impl Source {
    pub fn new() -> Source {
        Source::default()
    }

    pub fn from(bytes: &[u8]) -> Source {
        let mut s = Source::new();
        s.chain(bytes);
        s
    }

    /// Append more input to be consumed after everything already buffered.
    pub fn chain(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes.iter().copied());
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.front().copied()
    }

    pub fn next_symbol(&mut self) -> Option<u8> {
        let b = self.buf.pop_front();
        if b.is_some() {
            self.sent += 1;
        }
        b
    }

    /// Restore a symbol to the front of the source.
    pub fn pushback(&mut self, b: u8) {
        self.buf.push_front(b);
        self.sent = self.sent.saturating_sub(1);
    }

    /// Total symbols consumed so far.
    pub fn consumed(&self) -> usize {
        self.sent
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Outcome of driving a runner as far as the present input allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The machine reached completion; `Runner::terminal` tells whether the
    /// input satisfied the grammar
    Complete,
    /// A symbol is available but no machine on the stack accepts it; the
    /// source is left positioned at that symbol
    Stalled,
    /// Input exhausted mid-parse; chain more bytes and run again
    Starved,
}

#[derive(Debug)]
struct Frame {
    /// Chain of Sub-state ids from the root leading to this frame's machine
    path: Vec<StateId>,
    state: StateId,
    rounds: usize,
    needed: usize,
    collected: Vec<u8>,
    /// Current Sub state has already pushed (and since popped) its child
    sub_done: bool,
    /// The popped child ended in a terminal configuration
    sub_terminal: bool,
    delegated: bool,
}

impl Frame {
    fn new(path: Vec<StateId>, initial: StateId, needed: usize) -> Frame {
        Frame {
            path,
            state: initial,
            rounds: 0,
            needed,
            collected: Vec::new(),
            sub_done: false,
            sub_terminal: false,
            delegated: false,
        }
    }
}

/// Executes one machine over one source, retaining all state between calls
/// so that parsing resumes exactly where input ran out.
pub struct Runner {
    root: ArcAutomaton,
    frames: Vec<Frame>,
    complete: bool,
    ended_terminal: bool,
    no_progress: usize,
}

const NO_PROGRESS_LIMIT: usize = 65_536;

impl Runner {
    pub fn new(machine: ArcAutomaton) -> Runner {
        let initial = machine.initial;
        Runner {
            root: machine,
            frames: vec![Frame::new(Vec::new(), initial, 1)],
            complete: false,
            ended_terminal: false,
            no_progress: 0,
        }
    }

    /// Discard progress and prepare to parse another production.
    pub fn reset(&mut self) {
        let initial = self.root.initial;
        self.frames = vec![Frame::new(Vec::new(), initial, 1)];
        self.complete = false;
        self.ended_terminal = false;
        self.no_progress = 0;
    }

    /// Whether the machine completed AND the input satisfied the grammar: the
    /// machine was constructed terminal and its final inner sub-state was
    /// terminal.
    pub fn terminal(&self) -> bool {
        self.complete && self.ended_terminal
    }

    fn machine_at<'a>(root: &'a Automaton, path: &[StateId]) -> Result<&'a Automaton> {
        let mut m = root;
        for &sid in path {
            m = match &m.states[sid].kind {
                Kind::Sub(child) => child,
                _ => {
                    return Err(EnipError::Protocol(format!(
                        "machine {} frame path does not address a sub-machine",
                        root.name
                    )))
                }
            };
        }
        Ok(m)
    }

    fn resolve_repeat(machine: &Automaton, tree: &Tree) -> Result<usize> {
        match &machine.repeat {
            None => Ok(1),
            Some(Repeat::Fixed(n)) => Ok(*n),
            Some(Repeat::Path(p)) => tree
                .get(p)
                .and_then(|v| v.as_uint())
                .map(|v| v as usize)
                .ok_or_else(|| {
                    EnipError::Frame(format!(
                        "machine {} repeat count missing at {}",
                        machine.name, p
                    ))
                }),
        }
    }

    fn apply_emit(machine: &Automaton, collected: &[u8], tree: &mut Tree) {
        let Some(emit) = machine.emit else { return };
        let value = match emit {
            Emit::Bytes => Value::Bytes(collected.to_vec()),
            Emit::Uint => {
                let mut v = 0u64;
                for (i, b) in collected.iter().enumerate().take(8) {
                    v |= (*b as u64) << (8 * i);
                }
                Value::Uint(v)
            }
            Emit::Int => {
                let mut v = 0u64;
                for (i, b) in collected.iter().enumerate().take(8) {
                    v |= (*b as u64) << (8 * i);
                }
                let bits = collected.len().min(8) * 8;
                let signed = if bits > 0 && bits < 64 && v & (1 << (bits - 1)) != 0 {
                    (v | !((1u64 << bits) - 1)) as i64
                } else {
                    v as i64
                };
                Value::Int(signed)
            }
            Emit::Real => {
                if collected.len() >= 8 {
                    let mut a = [0u8; 8];
                    a.copy_from_slice(&collected[..8]);
                    Value::Real(f64::from_le_bytes(a))
                } else {
                    let mut a = [0u8; 4];
                    a[..collected.len().min(4)].copy_from_slice(&collected[..collected.len().min(4)]);
                    Value::Real(f32::from_le_bytes(a) as f64)
                }
            }
            Emit::Str => Value::Str(collected.iter().map(|&b| b as char).collect()),
        };
        tree.set(&machine.context, value);
    }

    /// Transition effects: consume per target policy, record, run action.
    fn enter(
        frame: &mut Frame,
        machine: &Automaton,
        target: StateId,
        via_symbol: bool,
        source: &mut Source,
        tree: &mut Tree,
    ) {
        let st = &machine.states[target];
        if via_symbol && st.consume != Consume::None {
            if let Some(b) = source.next_symbol() {
                if st.consume == Consume::Store {
                    frame.collected.push(b);
                }
            }
        }
        frame.state = target;
        frame.delegated = false;
        frame.sub_done = false;
        frame.sub_terminal = false;
        if let Some(Action::Mark(path)) = &st.action {
            tree.set(path, Value::Bool(true));
        }
    }

    /// A frame's current configuration counts as terminal when its state is
    /// terminal and any embedded sub-machine has finished terminally.
    fn frame_terminal(frame: &Frame, machine: &Automaton) -> bool {
        let st = &machine.states[frame.state];
        if !st.terminal {
            return false;
        }
        match st.kind {
            Kind::Plain => true,
            Kind::Sub(_) => frame.sub_done && frame.sub_terminal,
        }
    }

    /// Select a transition for the frame's current state given the peeked
    /// symbol: exact match first, then epsilon, then the any-symbol default.
    fn select_edge(frame: &Frame, machine: &Automaton, source: &Source) -> Option<(StateId, bool)> {
        let st = &machine.states[frame.state];
        if let Some(b) = source.peek() {
            if let Some(&(_, to)) = st.edges.iter().find(|(sym, _)| *sym == b) {
                return Some((to, true));
            }
            if let Some(to) = st.epsilon {
                return Some((to, false));
            }
            if let Some(to) = st.default {
                return Some((to, true));
            }
            None
        } else {
            st.epsilon.map(|to| (to, false))
        }
    }

    /// Finish the current round of the top frame; either reset for the next
    /// round, or complete the frame (popping it into its parent, or
    /// completing the whole run at the root).
    fn complete_round(&mut self, tree: &mut Tree) -> Result<()> {
        let fi = self.frames.len() - 1;
        let machine_path = self.frames[fi].path.clone();
        let machine = Self::machine_at(&self.root, &machine_path)?;
        let frame = &mut self.frames[fi];
        frame.rounds += 1;
        if frame.rounds < frame.needed {
            frame.state = machine.initial;
            frame.delegated = false;
            frame.sub_done = false;
            frame.sub_terminal = false;
            return Ok(());
        }
        let terminal = machine.terminal;
        if fi == 0 {
            Self::apply_emit(machine, &self.frames[0].collected, tree);
            self.complete = true;
            self.ended_terminal = terminal;
            return Ok(());
        }
        let done = self.frames.pop().unwrap();
        Self::apply_emit(machine, &done.collected, tree);
        let parent = self.frames.last_mut().unwrap();
        parent.sub_done = true;
        parent.sub_terminal = terminal;
        Ok(())
    }

    /// Pop frames above `depth` in preparation for an enclosing-machine
    /// transition; emits apply only for frames that ended terminally.
    fn unwind_to(&mut self, depth: usize, tree: &mut Tree) -> Result<()> {
        while self.frames.len() - 1 > depth {
            let fi = self.frames.len() - 1;
            let machine = Self::machine_at(&self.root, &self.frames[fi].path)?;
            let ended = Self::frame_terminal(&self.frames[fi], machine)
                && self.frames[fi].rounds + 1 >= self.frames[fi].needed;
            let done = self.frames.pop().unwrap();
            if ended {
                Self::apply_emit(machine, &done.collected, tree);
            }
            let parent = self.frames.last_mut().unwrap();
            parent.sub_done = true;
            parent.sub_terminal = ended && machine.terminal;
        }
        Ok(())
    }

    /// Drive the machine as far as the available input allows.  `eof` tells a
    /// greedy machine that no further input will ever arrive, permitting it
    /// to complete in a terminal configuration instead of reporting Starved.
    pub fn run(&mut self, source: &mut Source, tree: &mut Tree, eof: bool) -> Result<Outcome> {
        loop {
            if self.complete {
                return Ok(Outcome::Complete);
            }
            let consumed_before = source.consumed();
            let step = self.step(source, tree, eof)?;
            if source.consumed() != consumed_before {
                self.no_progress = 0;
            } else {
                self.no_progress += 1;
                if self.no_progress > NO_PROGRESS_LIMIT {
                    return Err(EnipError::Frame(format!(
                        "machine {} made no progress",
                        self.root.name
                    )));
                }
            }
            match step {
                None => continue,
                Some(outcome) => return Ok(outcome),
            }
        }
    }

    /// One transition, delegation, or resolution.  Returns None while
    /// progress continues.
    fn step(&mut self, source: &mut Source, tree: &mut Tree, eof: bool) -> Result<Option<Outcome>> {
        let fi = self.frames.len() - 1;
        let machine_path = self.frames[fi].path.clone();
        let machine = Self::machine_at(&self.root, &machine_path)?;
        let state = &machine.states[self.frames[fi].state];

        // Delegate into an embedded sub-machine exactly once per entry.
        if let Kind::Sub(child) = &state.kind {
            if !self.frames[fi].sub_done && !self.frames[fi].delegated {
                let needed = Self::resolve_repeat(child, tree)?;
                self.frames[fi].delegated = true;
                if needed == 0 {
                    Self::apply_emit(child, &[], tree);
                    self.frames[fi].sub_done = true;
                    self.frames[fi].sub_terminal = child.terminal;
                } else {
                    let mut path = machine_path.clone();
                    path.push(self.frames[fi].state);
                    let initial = child.initial;
                    self.frames.push(Frame::new(path, initial, needed));
                    // The initial state is entered without input; only its
                    // action side effect applies.
                    if let Some(Action::Mark(p)) = &child.states[initial].action {
                        tree.set(p, Value::Bool(true));
                    }
                }
                return Ok(None);
            }
        }

        // A non-greedy machine stops the moment it stands in a terminal
        // configuration.
        if !machine.greedy && Self::frame_terminal(&self.frames[fi], machine) {
            self.complete_round(tree)?;
            return Ok(None);
        }

        // Ordinary transition within the top frame.
        if let Some((target, via_symbol)) = Self::select_edge(&self.frames[fi], machine, source) {
            let frame = &mut self.frames[fi];
            Self::enter(frame, machine, target, via_symbol, source, tree);
            return Ok(None);
        }

        // No transition here: offer the symbol to each enclosing machine.
        for depth in (0..fi).rev() {
            let anc_machine = Self::machine_at(&self.root, &self.frames[depth].path)?;
            if Self::select_edge(&self.frames[depth], anc_machine, source).is_some() {
                self.unwind_to(depth, tree)?;
                let anc_machine = Self::machine_at(&self.root, &self.frames[depth].path)?;
                if let Some((target, via_symbol)) =
                    Self::select_edge(&self.frames[depth], anc_machine, source)
                {
                    let frame = &mut self.frames[depth];
                    Self::enter(frame, anc_machine, target, via_symbol, source, tree);
                }
                return Ok(None);
            }
        }

        // Nothing can transition.  Complete if every frame stands terminal
        // with all repeat rounds done; a frame whose child is still on the
        // stack inherits that child's terminality.
        let mut all_terminal = true;
        let mut child_terminal = true;
        for frame in self.frames.iter().rev() {
            let m = Self::machine_at(&self.root, &frame.path)?;
            let st = &m.states[frame.state];
            let sub_ok = match st.kind {
                Kind::Plain => true,
                Kind::Sub(_) => {
                    if frame.delegated && !frame.sub_done {
                        child_terminal
                    } else {
                        frame.sub_done && frame.sub_terminal
                    }
                }
            };
            if !(st.terminal && sub_ok && frame.rounds + 1 >= frame.needed) {
                all_terminal = false;
                break;
            }
            child_terminal = m.terminal;
        }

        match source.peek() {
            Some(_) => {
                if all_terminal {
                    // Greedy machines stop at the first terminal state from
                    // which no further transition is possible.
                    self.finish(tree)?;
                    Ok(Some(Outcome::Complete))
                } else {
                    Ok(Some(Outcome::Stalled))
                }
            }
            None => {
                if all_terminal && (eof || !machine_could_extend(&self.root, &self.frames)?) {
                    self.finish(tree)?;
                    Ok(Some(Outcome::Complete))
                } else {
                    Ok(Some(Outcome::Starved))
                }
            }
        }
    }

    /// Unwind every frame through round completion; callers have verified
    /// that the whole stack stands terminal.
    fn finish(&mut self, tree: &mut Tree) -> Result<()> {
        while self.frames.len() > 1 {
            self.complete_round(tree)?;
        }
        self.complete_round(tree)
    }
}

/// Whether any frame's current state could still transition given more
/// input; if not, an all-terminal configuration may complete without EOF.
fn machine_could_extend(root: &Automaton, frames: &[Frame]) -> Result<bool> {
    for frame in frames {
        let m = Runner::machine_at(root, &frame.path)?;
        let st = &m.states[frame.state];
        if !st.edges.is_empty() || st.default.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Incrementally constructs an Automaton.
pub struct Builder {
    name: String,
    states: Vec<State>,
}

impl Builder {
    pub fn new(name: &str) -> Builder {
        Builder { name: name.to_string(), states: Vec::new() }
    }

    fn push(&mut self, name: &str, consume: Consume, kind: Kind) -> StateId {
        self.states.push(State {
            name: name.to_string(),
            terminal: false,
            consume,
            action: None,
            kind,
            edges: Vec::new(),
            epsilon: None,
            default: None,
        });
        self.states.len() - 1
    }

    /// A state that does not consume input.
    pub fn state(&mut self, name: &str) -> StateId {
        self.push(name, Consume::None, Kind::Plain)
    }

    /// A state that consumes and keeps the driving symbol.
    pub fn input(&mut self, name: &str) -> StateId {
        self.push(name, Consume::Store, Kind::Plain)
    }

    /// A state that consumes and discards the driving symbol.
    pub fn discard(&mut self, name: &str) -> StateId {
        self.push(name, Consume::Discard, Kind::Plain)
    }

    /// A state embedding a whole sub-machine.
    pub fn sub(&mut self, name: &str, machine: Automaton) -> StateId {
        self.push(name, Consume::None, Kind::Sub(Box::new(machine)))
    }

    pub fn terminal(&mut self, id: StateId) {
        self.states[id].terminal = true;
    }

    pub fn action(&mut self, id: StateId, action: Action) {
        self.states[id].action = Some(action);
    }

    /// Transition on an exact symbol.
    pub fn on(&mut self, from: StateId, symbol: u8, to: StateId) {
        self.states[from].edges.push((symbol, to));
    }

    /// Epsilon transition: taken without examining input.
    pub fn eps(&mut self, from: StateId, to: StateId) {
        self.states[from].epsilon = Some(to);
    }

    /// Default transition: taken on any otherwise-unmatched symbol.
    pub fn any(&mut self, from: StateId, to: StateId) {
        self.states[from].default = Some(to);
    }

    pub fn build(self, initial: StateId, config: Config) -> Automaton {
        Automaton {
            name: self.name,
            states: self.states,
            initial,
            context: config.context,
            greedy: config.greedy,
            terminal: config.terminal,
            repeat: config.repeat,
            emit: config.emit,
        }
    }
}

/// Machine-level configuration handed to `Builder::build`.
#[derive(Debug, Default)]
pub struct Config {
    pub context: String,
    pub greedy: bool,
    pub terminal: bool,
    pub repeat: Option<Repeat>,
    pub emit: Option<Emit>,
}

impl Config {
    pub fn terminal_at(context: &str) -> Config {
        Config { context: context.to_string(), terminal: true, ..Config::default() }
    }
}

/// Scan `repeat` octets into the context as raw bytes.
pub fn octets(name: &str, context: &str, repeat: Repeat) -> Automaton {
    let mut b = Builder::new(name);
    let entry = b.state("entry");
    let take = b.input("byte");
    b.terminal(take);
    b.any(entry, take);
    b.build(
        entry,
        Config {
            context: context.to_string(),
            greedy: false,
            terminal: true,
            repeat: Some(repeat),
            emit: Some(Emit::Bytes),
        },
    )
}

/// Scan `repeat` octets and drop them.
pub fn octets_drop(name: &str, repeat: Repeat) -> Automaton {
    let mut b = Builder::new(name);
    let entry = b.state("entry");
    let take = b.discard("drop");
    b.terminal(take);
    b.any(entry, take);
    b.build(
        entry,
        Config {
            context: String::new(),
            greedy: false,
            terminal: true,
            repeat: Some(repeat),
            emit: None,
        },
    )
}

/// A fixed-width little-endian scalar scanner emitting at `context`.
pub fn scalar(name: &str, context: &str, width: usize, emit: Emit) -> Automaton {
    let mut b = Builder::new(name);
    let entry = b.state("entry");
    let mut prev = entry;
    for i in 0..width {
        let s = b.input(&format!("byte{}", i));
        b.any(prev, s);
        prev = s;
    }
    b.terminal(prev);
    b.build(
        entry,
        Config {
            context: context.to_string(),
            greedy: false,
            terminal: true,
            repeat: None,
            emit: Some(emit),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(machine: Automaton, input: &[u8], eof: bool) -> (Outcome, bool, usize, Tree) {
        let arc = Arc::new(machine);
        let mut runner = Runner::new(arc);
        let mut source = Source::from(input);
        let mut tree = Tree::new();
        let outcome = runner.run(&mut source, &mut tree, eof).unwrap();
        (outcome, runner.terminal(), source.consumed(), tree)
    }

    #[test]
    fn test_scalar_parses_little_endian() {
        let m = scalar("UINT", "val", 2, Emit::Uint);
        let (outcome, terminal, consumed, tree) = run_all(m, &[0x34, 0x12, 0xFF], true);
        assert_eq!(outcome, Outcome::Complete);
        assert!(terminal);
        assert_eq!(consumed, 2);
        assert_eq!(tree.get("val"), Some(&Value::Uint(0x1234)));
    }

    #[test]
    fn test_signed_scalar_sign_extends() {
        let m = scalar("INT", "val", 2, Emit::Int);
        let (_, _, _, tree) = run_all(m, &[0xFE, 0xFF], true);
        assert_eq!(tree.get("val"), Some(&Value::Int(-2)));
    }

    #[test]
    fn test_octets_repeat_from_tree() {
        let mut b = Builder::new("wrap");
        let body = octets("payload", "data", Repeat::Path("size".into()));
        let entry = b.state("entry");
        let s = b.sub("body", body);
        b.terminal(s);
        b.eps(entry, s);
        let m = b.build(entry, Config::terminal_at(""));

        let arc = Arc::new(m);
        let mut runner = Runner::new(arc);
        let mut source = Source::from(b"abcdef");
        let mut tree = Tree::new();
        tree.set("size", Value::Uint(4));
        let outcome = runner.run(&mut source, &mut tree, false).unwrap();
        assert_eq!(outcome, Outcome::Complete);
        assert!(runner.terminal());
        assert_eq!(tree.get("data"), Some(&Value::Bytes(b"abcd".to_vec())));
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn test_starved_then_resumed() {
        let m = scalar("UDINT", "val", 4, Emit::Uint);
        let arc = Arc::new(m);
        let mut runner = Runner::new(arc);
        let mut source = Source::from(&[0x01, 0x02]);
        let mut tree = Tree::new();
        assert_eq!(runner.run(&mut source, &mut tree, false).unwrap(), Outcome::Starved);
        source.chain(&[0x03, 0x04]);
        assert_eq!(runner.run(&mut source, &mut tree, false).unwrap(), Outcome::Complete);
        assert_eq!(tree.get("val"), Some(&Value::Uint(0x04030201)));
    }

    #[test]
    fn test_stall_leaves_source_unconsumed() {
        // Machine accepting exactly b"ab"
        let mut b = Builder::new("ab");
        let entry = b.state("entry");
        let sa = b.input("a");
        let sb = b.input("b");
        b.terminal(sb);
        b.on(entry, b'a', sa);
        b.on(sa, b'b', sb);
        let m = b.build(entry, Config::terminal_at(""));
        let (outcome, terminal, consumed, _) = run_all(m, b"ax", true);
        assert_eq!(outcome, Outcome::Stalled);
        assert!(!terminal);
        assert_eq!(consumed, 1); // 'a' consumed; 'x' still pending
    }

    #[test]
    fn test_non_greedy_stops_at_first_terminal() {
        // a+ non-greedy: entry --a--> A(terminal); A --a--> A
        let mut b = Builder::new("a+");
        let entry = b.state("entry");
        let sa = b.input("a");
        b.terminal(sa);
        b.on(entry, b'a', sa);
        b.on(sa, b'a', sa);
        let m = b.build(
            entry,
            Config { context: String::new(), greedy: false, terminal: true, repeat: None, emit: None },
        );
        let (outcome, terminal, consumed, _) = run_all(m, b"aaaa", true);
        assert_eq!(outcome, Outcome::Complete);
        assert!(terminal);
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_greedy_takes_longest_prefix() {
        let mut b = Builder::new("a+");
        let entry = b.state("entry");
        let sa = b.input("a");
        b.terminal(sa);
        b.on(entry, b'a', sa);
        b.on(sa, b'a', sa);
        let m = b.build(
            entry,
            Config { context: String::new(), greedy: true, terminal: true, repeat: None, emit: None },
        );
        let (outcome, terminal, consumed, _) = run_all(m, b"aaab", true);
        assert_eq!(outcome, Outcome::Complete);
        assert!(terminal);
        assert_eq!(consumed, 3); // 'b' not consumed
    }

    #[test]
    fn test_enclosing_machine_fallback() {
        // Inner machine accepts 'a'*; outer transitions on 'b' to a terminal
        // input state, then re-enters another inner 'a'* machine: accepts
        // a* b a*.
        fn a_star(name: &str) -> Automaton {
            let mut b = Builder::new(name);
            let entry = b.state("entry");
            let sa = b.input("a");
            b.terminal(entry);
            b.terminal(sa);
            b.on(entry, b'a', sa);
            b.on(sa, b'a', sa);
            b.build(
                entry,
                Config { context: String::new(), greedy: true, terminal: true, repeat: None, emit: None },
            )
        }
        let mut b = Builder::new("outer");
        let first = b.sub("first", a_star("A1"));
        let mid = b.discard("b");
        let second = b.sub("second", a_star("A2"));
        b.terminal(second);
        b.on(first, b'b', mid);
        b.eps(mid, second);
        let m = b.build(
            first,
            Config { context: String::new(), greedy: true, terminal: true, repeat: None, emit: None },
        );
        let (outcome, terminal, consumed, _) = run_all(m, b"aabaa", true);
        assert_eq!(outcome, Outcome::Complete);
        assert!(terminal);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_unaccepted_symbol_never_advances_composed_source() {
        let mut b = Builder::new("outer");
        let inner = scalar("UINT", "v", 2, Emit::Uint);
        let s0 = b.sub("inner", inner);
        b.terminal(s0);
        let m = b.build(
            s0,
            Config { context: String::new(), greedy: false, terminal: true, repeat: None, emit: None },
        );
        // Inner completes after 2 bytes; remaining symbol is unaccepted
        let (outcome, _, consumed, _) = run_all(m, &[1, 0, 9], true);
        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_mark_action_writes_tree() {
        let mut b = Builder::new("marker");
        let entry = b.state("entry");
        let done = b.discard("x");
        b.terminal(done);
        b.action(done, Action::Mark("seen".into()));
        b.any(entry, done);
        let m = b.build(entry, Config::terminal_at(""));
        let (_, _, _, tree) = run_all(m, b"z", true);
        assert_eq!(tree.get("seen"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_pushback_restores_position() {
        let mut s = Source::from(b"xy");
        assert_eq!(s.next_symbol(), Some(b'x'));
        assert_eq!(s.consumed(), 1);
        s.pushback(b'x');
        assert_eq!(s.consumed(), 0);
        assert_eq!(s.peek(), Some(b'x'));
    }
}
