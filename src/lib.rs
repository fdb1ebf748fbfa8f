//! Regex-style pattern matching over sequences of arbitrary typed elements.
//!
//! Where a classical regex engine matches bytes against byte classes, this
//! engine matches elements of any type `T` against user-supplied predicate
//! functions `&T -> bool`.  Patterns are assembled with a fluent builder,
//! lowered by Thompson's construction into an NFA, and simulated in the
//! Pike style: a set of live threads is advanced in lockstep over the
//! input, one element at a time, so matching never backtracks.
//!
//! # Architecture
//!
//! The pipeline is:
//!
//! ```text
//! Pattern<T> (AST)  ──Compiler::build──>  Matcher<T> (NFA + predicate table)
//!                                             │
//!                         Scanner<'_, T> ◄────┘  (push / end streaming driver)
//! ```
//!
//! `find_all`, `find` and `is_match` are thin loops over a [`Scanner`], so
//! array, iterator and streamed inputs all go through the same simulation
//! and cannot disagree.
//!
//! ## Priorities instead of backtracking
//!
//! Greedy/lazy quantifiers, alternation order and leftmost preference are
//! all expressed by a single mechanism: every `Split` state explores `out`
//! before `out1`, and the epsilon-closure walk marks each state in a
//! per-step seen-set on entry.  The first thread to claim a state is the
//! one that reached it along the highest-priority path, and duplicate
//! claims are dropped.  A greedy loop places its re-entry edge on `out`
//! and its exit on `out1`; a lazy loop swaps them; an alternation chains
//! splits so earlier branches sit on `out`.  The start state is re-seeded
//! at every input position with the lowest priority of all, which makes
//! earlier match origins outrank later ones.
//!
//! ## Definitive matches
//!
//! When a thread reaches the accept state, every lower-priority thread is
//! cut and the accept is recorded as the pending match.  The pending
//! match is emitted only once no continuation of the input can replace
//! it: either the thread set has died (which is immediate for lazy
//! patterns, whose accept outranks every continuation), or end-of-input
//! was signalled.  Until then a surviving higher-priority thread may
//! overwrite the record with a longer or earlier-starting match.  This is
//! what lets the streaming scanner hand out matches mid-stream without
//! ever retracting one.
//!
//! ## Element buffering
//!
//! The scanner retains a window of elements stretching back to the
//! earliest position any live thread (or the pending match) started at.
//! On emission the matched elements are moved out of the window into the
//! [`Match`], the simulation restarts just past the match, and the rest
//! of the window is replayed.  A greedy unbounded quantifier can keep the
//! window growing until `end()`; that is inherent to greedy semantics,
//! not an engine defect.

use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::ops::{Index, IndexMut};
use std::rc::Rc;

use indexmap::IndexMap;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// An error returned when a pattern violates the AST invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// An alternation with fewer than two branches (e.g. `one_of` of an
    /// empty or single-element list).
    EmptyAlternation,
    /// A repetition whose range is empty or inverted (`times(0)`,
    /// `between(5, 2)`, `between(_, 0)`).
    InvalidRepeat { min: u32, max: Option<u32> },
    /// An anchor somewhere other than the outermost position of its end
    /// of the pattern (e.g. an anchored pattern appended mid-sequence, or
    /// an anchor under a quantifier).
    MisplacedAnchor,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyAlternation => {
                write!(f, "alternation requires at least two branches")
            }
            Self::InvalidRepeat { min, max: Some(max) } => {
                write!(f, "invalid repetition range {{{},{}}}", min, max)
            }
            Self::InvalidRepeat { min, max: None } => {
                write!(f, "invalid repetition range {{{},}}", min)
            }
            Self::MisplacedAnchor => {
                write!(f, "anchor is only allowed at the outermost position of the pattern")
            }
        }
    }
}

impl std::error::Error for CompileError {}

// ---------------------------------------------------------------------------
// Pattern AST and fluent builder
// ---------------------------------------------------------------------------

/// A user predicate deciding whether one element matches.  Reference
/// counted so that quantifier unrolling can share a single closure across
/// all unrolled copies.
type PredFn<T> = Rc<dyn Fn(&T) -> bool>;

/// Quantifier disposition: consume as much as possible while still
/// letting the remainder match, or as little.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Greedy,
    Lazy,
}

/// A pattern AST node.  Immutable once constructed; the builder methods
/// on [`Pattern`] consume and rewrap nodes instead of mutating them.
enum Node<T> {
    /// Match exactly one element satisfying the predicate.
    Pred(PredFn<T>),
    /// Match exactly one element, whatever it is.
    Any,
    /// Ordered sequence; always flattened (no `Concat` child is itself a
    /// `Concat`) and never empty.
    Concat(Vec<Node<T>>),
    /// Ordered alternatives; earlier branches win ties.  At least two
    /// branches once validated.
    Alt(Vec<Node<T>>),
    /// Match `child` between `min` and `max` times inclusive (`None` max
    /// means unbounded).
    Repeat {
        child: Box<Node<T>>,
        min: u32,
        max: Option<u32>,
        mode: Mode,
    },
    /// Match `child` only when it starts at position 0.
    AnchorStart(Box<Node<T>>),
    /// Match `child` only when it ends at the end of the input.
    AnchorEnd(Box<Node<T>>),
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pred(_) => f.write_str("Pred(<fn>)"),
            Self::Any => f.write_str("Any"),
            Self::Concat(children) => f.debug_tuple("Concat").field(children).finish(),
            Self::Alt(branches) => f.debug_tuple("Alt").field(branches).finish(),
            Self::Repeat { child, min, max, mode } => f
                .debug_struct("Repeat")
                .field("child", child)
                .field("min", min)
                .field("max", max)
                .field("mode", mode)
                .finish(),
            Self::AnchorStart(child) => f.debug_tuple("AnchorStart").field(child).finish(),
            Self::AnchorEnd(child) => f.debug_tuple("AnchorEnd").field(child).finish(),
        }
    }
}

/// A composable pattern over elements of type `T`.
///
/// Built from [`Pattern::pred`], [`Pattern::any`] or [`Pattern::one_of`]
/// and extended by chaining; every method consumes the pattern and
/// returns the combined one.  Quantifiers follow the "modifies the last
/// element" contract: applied to a sequence they rewrap only its trailing
/// element, while [`Pattern::at_start`] and [`Pattern::at_end`] always
/// wrap the whole pattern.
///
/// Invalid combinations (empty alternations, `times(0)`, inverted
/// `between` ranges, anchors in the middle of a sequence) are reported by
/// [`Pattern::compile`], keeping the chain itself infallible.
pub struct Pattern<T> {
    root: Node<T>,
}

impl<T> fmt::Debug for Pattern<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

/// Anything that can stand where a sub-pattern is expected: a closure
/// `&T -> bool` (lifted to a single-element pattern) or a [`Pattern`].
pub trait IntoPattern<T> {
    fn into_pattern(self) -> Pattern<T>;
}

impl<T> IntoPattern<T> for Pattern<T> {
    fn into_pattern(self) -> Pattern<T> {
        self
    }
}

impl<T, F> IntoPattern<T> for F
where
    F: Fn(&T) -> bool + 'static,
{
    fn into_pattern(self) -> Pattern<T> {
        Pattern::pred(self)
    }
}

impl<T> Pattern<T> {
    /// A pattern matching one element satisfying `p`.
    pub fn pred(p: impl Fn(&T) -> bool + 'static) -> Self {
        Self { root: Node::Pred(Rc::new(p)) }
    }

    /// A pattern matching any single element.
    pub fn any() -> Self {
        Self { root: Node::Any }
    }

    /// A pattern matching whichever alternative matches; earlier
    /// alternatives win ties.  Fewer than two alternatives is rejected by
    /// [`compile`](Self::compile).
    pub fn one_of(alternatives: Vec<Pattern<T>>) -> Self {
        let mut branches = Vec::with_capacity(alternatives.len());
        for alt in alternatives {
            match alt.root {
                Node::Alt(inner) => branches.extend(inner),
                other => branches.push(other),
            }
        }
        Self { root: Node::Alt(branches) }
    }

    /// Sequence: this pattern followed by `next`.
    pub fn then(self, next: impl IntoPattern<T>) -> Self {
        let mut children = match self.root {
            Node::Concat(children) => children,
            other => vec![other],
        };
        match next.into_pattern().root {
            Node::Concat(inner) => children.extend(inner),
            other => children.push(other),
        }
        Self { root: Node::Concat(children) }
    }

    /// Alternation: this pattern or `alternative`, preferring this one.
    pub fn or(self, alternative: impl IntoPattern<T>) -> Self {
        let mut branches = match self.root {
            Node::Alt(branches) => branches,
            other => vec![other],
        };
        match alternative.into_pattern().root {
            Node::Alt(inner) => branches.extend(inner),
            other => branches.push(other),
        }
        Self { root: Node::Alt(branches) }
    }

    /// Repeat the last element one or more times.
    pub fn one_or_more(self, mode: Mode) -> Self {
        self.repeat_last(1, None, mode)
    }

    /// Repeat the last element zero or more times.
    pub fn zero_or_more(self, mode: Mode) -> Self {
        self.repeat_last(0, None, mode)
    }

    /// Match the last element zero or one time.
    pub fn optional(self, mode: Mode) -> Self {
        self.repeat_last(0, Some(1), mode)
    }

    /// Repeat the last element exactly `n` times.  `n = 0` is rejected by
    /// [`compile`](Self::compile).
    pub fn times(self, n: u32) -> Self {
        self.repeat_last(n, Some(n), Mode::Greedy)
    }

    /// Repeat the last element between `min` and `max` times inclusive.
    /// `max = 0` and `min > max` are rejected by [`compile`](Self::compile).
    pub fn between(self, min: u32, max: u32, mode: Mode) -> Self {
        self.repeat_last(min, Some(max), mode)
    }

    /// Anchor the whole pattern to the start of the input.
    pub fn at_start(self) -> Self {
        Self { root: Node::AnchorStart(Box::new(self.root)) }
    }

    /// Anchor the whole pattern to the end of the input.
    pub fn at_end(self) -> Self {
        Self { root: Node::AnchorEnd(Box::new(self.root)) }
    }

    /// Wrap the trailing element of a sequence (or the whole node for
    /// anything else) in a `Repeat`.
    fn repeat_last(self, min: u32, max: Option<u32>, mode: Mode) -> Self {
        fn wrap<T>(node: Node<T>, min: u32, max: Option<u32>, mode: Mode) -> Node<T> {
            Node::Repeat { child: Box::new(node), min, max, mode }
        }
        match self.root {
            Node::Concat(mut children) => {
                if let Some(last) = children.pop() {
                    children.push(wrap(last, min, max, mode));
                }
                Self { root: Node::Concat(children) }
            }
            other => Self { root: wrap(other, min, max, mode) },
        }
    }

    /// Compile the pattern into a ready-to-run [`Matcher`].
    pub fn compile(self) -> Result<Matcher<T>, CompileError> {
        Compiler::new().build(&self.root)
    }
}

/// Check the AST invariants before lowering.  `head`/`tail` track whether
/// the node still sits at the outermost start/end position of the whole
/// pattern, which is the only place anchors are allowed.
fn validate<T>(node: &Node<T>, head: bool, tail: bool) -> Result<(), CompileError> {
    match node {
        Node::Pred(_) | Node::Any => Ok(()),
        Node::Concat(children) => {
            let last = children.len() - 1;
            for (i, child) in children.iter().enumerate() {
                validate(child, head && i == 0, tail && i == last)?;
            }
            Ok(())
        }
        Node::Alt(branches) => {
            if branches.len() < 2 {
                return Err(CompileError::EmptyAlternation);
            }
            for branch in branches {
                validate(branch, head, tail)?;
            }
            Ok(())
        }
        Node::Repeat { child, min, max, .. } => {
            if let Some(max) = max {
                if *max == 0 || min > max {
                    return Err(CompileError::InvalidRepeat { min: *min, max: Some(*max) });
                }
            }
            validate(child, false, false)
        }
        Node::AnchorStart(child) => {
            if !head {
                return Err(CompileError::MisplacedAnchor);
            }
            validate(child, false, tail)
        }
        Node::AnchorEnd(child) => {
            if !tail {
                return Err(CompileError::MisplacedAnchor);
            }
            validate(child, head, false)
        }
    }
}

// ---------------------------------------------------------------------------
// NFA states
// ---------------------------------------------------------------------------

/// Index into the predicate table ([`Matcher::preds`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PredIdx(usize);

impl PredIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0
    }
}

impl fmt::Display for PredIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// `preds[pred_idx]`: typed access to the predicate table.
impl<T> Index<PredIdx> for [PredFn<T>] {
    type Output = PredFn<T>;

    #[inline]
    fn index(&self, idx: PredIdx) -> &PredFn<T> {
        &self[idx.idx()]
    }
}

/// The guard on a consuming transition: either the wildcard or a
/// predicate reference.
#[derive(Clone, Copy, Debug)]
enum Guard {
    Any,
    Pred(PredIdx),
}

/// A single NFA state.
///
/// Epsilon states (`Split`, `AssertStart`, `AssertEnd`) are followed
/// during [`Scanner::add_thread`]; `Consume` states are stepped over one
/// input element at a time.  For `Split`, `out` is explored before
/// `out1`, which makes `out` the higher-priority edge; the whole
/// greedy/lazy/alternation machinery rests on that ordering.
#[derive(Clone, Copy, Debug)]
enum State {
    /// Match one element against the guard, then follow `out`.
    Consume { guard: Guard, out: StateIdx },

    /// Epsilon fork: follow `out` first, then `out1`.
    Split { out: StateIdx, out1: StateIdx },

    /// Zero-width assertion: follow `out` only at the start of input.
    AssertStart { out: StateIdx },

    /// Zero-width assertion: follow `out` only once end-of-input is
    /// known.  Until then the state parks in the thread list and dies if
    /// another element arrives.
    AssertEnd { out: StateIdx },

    /// Accepting state.
    Match,
}

/// Index into the NFA state array.
///
/// [`StateIdx::NONE`] is the "dangling/unpatched" marker used while the
/// compiler threads its slot lists through unfinished states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct StateIdx(u32);

impl StateIdx {
    /// Sentinel for unpatched `out` fields during construction.
    const NONE: Self = Self(u32::MAX);

    /// Return the raw index as `usize`.  Panics on `NONE` in debug builds.
    #[inline]
    fn idx(self) -> usize {
        debug_assert!(self != Self::NONE, "StateIdx::NONE used as index");
        self.0 as usize
    }
}

impl fmt::Display for StateIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `states[state_idx]`: typed access to the NFA state array.
impl Index<StateIdx> for [State] {
    type Output = State;

    #[inline]
    fn index(&self, idx: StateIdx) -> &State {
        &self[idx.idx()]
    }
}

impl IndexMut<StateIdx> for [State] {
    #[inline]
    fn index_mut(&mut self, idx: StateIdx) -> &mut State {
        &mut self[idx.idx()]
    }
}

struct StateList(Box<[State]>);

impl fmt::Debug for StateList {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_map().entries(self.0.iter().enumerate()).finish()
    }
}

impl std::ops::Deref for StateList {
    type Target = [State];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Compiler (Thompson's construction)
// ---------------------------------------------------------------------------

/// A dangling out-slot of a state under construction: the state index
/// plus which of its out fields (`out` or `out1`) is the dangling one.
/// A greedy loop dangles `out1` (exit is low priority) while a lazy loop
/// dangles `out` (exit is high priority), so the field must travel with
/// the index.
///
/// Slots form linked lists threaded *through the states themselves*: an
/// unpatched field temporarily stores the bits of the next slot in the
/// list (or [`Slot::NONE`]), and [`Compiler::patch`] walks the chain
/// overwriting each field with the real target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot(u32);

impl Slot {
    const NONE: Self = Self(u32::MAX);

    fn out(state: StateIdx) -> Self {
        Self(state.0 << 1)
    }

    fn out1(state: StateIdx) -> Self {
        Self(state.0 << 1 | 1)
    }

    fn state(self) -> StateIdx {
        StateIdx(self.0 >> 1)
    }

    fn is_out1(self) -> bool {
        self.0 & 1 == 1
    }
}

/// A partially-built NFA fragment: an entry state plus the linked list of
/// dangling out-slots that will be patched to whatever comes next.
#[derive(Clone, Copy, Debug)]
struct Fragment {
    start: StateIdx,
    out: Slot,
}

/// Lowers a validated pattern AST into a [`Matcher`] by Thompson's
/// construction.  Fresh states come from a monotonic counter (the length
/// of `states`); predicates are interned by `Rc` identity so unrolled
/// quantifier copies share one table slot per distinct closure.
struct Compiler<T> {
    states: Vec<State>,
    /// Predicate table keyed by the closure allocation's address.
    preds: IndexMap<usize, PredFn<T>>,
}

impl<T> Compiler<T> {
    fn new() -> Self {
        Self { states: Vec::new(), preds: IndexMap::new() }
    }

    /// Push a new NFA state and return its index.
    fn state(&mut self, state: State) -> StateIdx {
        let idx = StateIdx(self.states.len() as u32);
        self.states.push(state);
        idx
    }

    /// Return the table index for `p`, inserting it if this closure has
    /// not been seen before.
    fn intern_pred(&mut self, p: &PredFn<T>) -> PredIdx {
        let key = Rc::as_ptr(p) as *const () as usize;
        let (idx, _) = self.preds.insert_full(key, Rc::clone(p));
        PredIdx(idx)
    }

    /// Read the field addressed by `slot`.  During construction the
    /// value is the next slot in the dangling list, reinterpreted as a
    /// state index.
    fn slot_value(&self, slot: Slot) -> StateIdx {
        match self.states.as_slice()[slot.state()] {
            State::Split { out, out1 } => {
                if slot.is_out1() {
                    out1
                } else {
                    out
                }
            }
            State::Consume { out, .. }
            | State::AssertStart { out }
            | State::AssertEnd { out } => out,
            State::Match => unreachable!("Match has no out slot"),
        }
    }

    /// Overwrite the field addressed by `slot`.
    fn set_slot(&mut self, slot: Slot, value: StateIdx) {
        match &mut self.states.as_mut_slice()[slot.state()] {
            State::Split { out, out1 } => {
                if slot.is_out1() {
                    *out1 = value;
                } else {
                    *out = value;
                }
            }
            State::Consume { out, .. }
            | State::AssertStart { out }
            | State::AssertEnd { out } => *out = value,
            State::Match => unreachable!("Match has no out slot"),
        }
    }

    /// Walk the linked list of dangling slots starting at `list` and
    /// patch each one to point to `target`.
    fn patch(&mut self, mut list: Slot, target: StateIdx) {
        while list != Slot::NONE {
            let next = Slot(self.slot_value(list).0);
            self.set_slot(list, target);
            list = next;
        }
    }

    /// Splice two dangling-slot lists into one.
    fn append(&mut self, a: Slot, b: Slot) -> Slot {
        if a == Slot::NONE {
            return b;
        }
        let mut last = a;
        loop {
            let next = Slot(self.slot_value(last).0);
            if next == Slot::NONE {
                self.set_slot(last, StateIdx(b.0));
                return a;
            }
            last = next;
        }
    }

    /// Emit a fresh consuming state.
    fn consume(&mut self, guard: Guard) -> Fragment {
        let idx = self.state(State::Consume { guard, out: StateIdx::NONE });
        Fragment { start: idx, out: Slot::out(idx) }
    }

    /// Emit the branch split guarding a repetition body.  Greedy prefers
    /// entering `body`; lazy prefers the (dangling) way around it.
    fn loop_split(&mut self, body: StateIdx, mode: Mode) -> (StateIdx, Slot) {
        match mode {
            Mode::Greedy => {
                let idx = self.state(State::Split { out: body, out1: StateIdx::NONE });
                (idx, Slot::out1(idx))
            }
            Mode::Lazy => {
                let idx = self.state(State::Split { out: StateIdx::NONE, out1: body });
                (idx, Slot::out(idx))
            }
        }
    }

    /// Lower one AST node into an NFA fragment.
    fn compile_node(&mut self, node: &Node<T>) -> Fragment {
        match node {
            Node::Pred(p) => {
                let guard = Guard::Pred(self.intern_pred(p));
                self.consume(guard)
            }
            Node::Any => self.consume(Guard::Any),
            Node::Concat(children) => {
                let mut iter = children.iter();
                let mut frag = match iter.next() {
                    Some(first) => self.compile_node(first),
                    None => unreachable!("empty Concat rejected before lowering"),
                };
                for child in iter {
                    let next = self.compile_node(child);
                    self.patch(frag.out, next.start);
                    frag = Fragment { start: frag.start, out: next.out };
                }
                frag
            }
            Node::Alt(branches) => {
                // Compile the branches in order, then chain splits from
                // the right so the first branch ends up on the top-level
                // `out` edge: highest priority, left-to-right ties.
                let frags: Vec<Fragment> =
                    branches.iter().map(|b| self.compile_node(b)).collect();
                let mut iter = frags.into_iter().rev();
                let mut acc = match iter.next() {
                    Some(last) => last,
                    None => unreachable!("empty Alt rejected before lowering"),
                };
                for frag in iter {
                    let split =
                        self.state(State::Split { out: frag.start, out1: acc.start });
                    let out = self.append(frag.out, acc.out);
                    acc = Fragment { start: split, out };
                }
                acc
            }
            Node::Repeat { child, min, max, mode } => {
                self.compile_repeat(child, *min as usize, max.map(|m| m as usize), *mode)
            }
            Node::AnchorStart(child) => {
                let frag = self.compile_node(child);
                let idx = self.state(State::AssertStart { out: frag.start });
                Fragment { start: idx, out: frag.out }
            }
            Node::AnchorEnd(child) => {
                let frag = self.compile_node(child);
                let idx = self.state(State::AssertEnd { out: StateIdx::NONE });
                self.patch(frag.out, idx);
                Fragment { start: frag.start, out: Slot::out(idx) }
            }
        }
    }

    /// Unroll a repetition.
    ///
    /// The mandatory prefix is a chain of `min` compiled copies of the
    /// body.  An unbounded tail appends a loop split that re-enters the
    /// last copy (or a dedicated copy when `min = 0`); a bounded tail
    /// appends `max - min` optional copies, each behind a branch split
    /// whose skip edge jumps straight past the whole repetition.
    /// Greediness is purely the operand order of those splits.
    fn compile_repeat(
        &mut self,
        child: &Node<T>,
        min: usize,
        max: Option<usize>,
        mode: Mode,
    ) -> Fragment {
        match max {
            None => {
                let body = self.compile_node(child);
                if min == 0 {
                    let (l, exit) = self.loop_split(body.start, mode);
                    self.patch(body.out, l);
                    return Fragment { start: l, out: exit };
                }
                // Chain of `min` copies; the loop re-enters the last one.
                let mut frag = body;
                let mut last_start = frag.start;
                for _ in 1..min {
                    let next = self.compile_node(child);
                    self.patch(frag.out, next.start);
                    last_start = next.start;
                    frag = Fragment { start: frag.start, out: next.out };
                }
                let (l, exit) = self.loop_split(last_start, mode);
                self.patch(frag.out, l);
                Fragment { start: frag.start, out: exit }
            }
            Some(max) => {
                let mut entry = StateIdx::NONE;
                let mut outs = Slot::NONE;
                let mut exits = Slot::NONE;
                for i in 0..max {
                    let body = self.compile_node(child);
                    let first = if i < min {
                        // Mandatory copy: wired directly in line.
                        body.start
                    } else {
                        // Optional copy: reached through a branch split
                        // whose skip edge dangles out of the repetition.
                        let (branch, skip) = self.loop_split(body.start, mode);
                        exits = self.append(exits, skip);
                        branch
                    };
                    if entry == StateIdx::NONE {
                        entry = first;
                    } else {
                        self.patch(outs, first);
                    }
                    outs = body.out;
                }
                let out = self.append(outs, exits);
                Fragment { start: entry, out }
            }
        }
    }

    /// Validate and lower a whole pattern, then allocate the single
    /// accept state and patch every remaining dangling slot to it.
    fn build(mut self, root: &Node<T>) -> Result<Matcher<T>, CompileError> {
        validate(root, true, true)?;
        let frag = self.compile_node(root);
        let accept = self.state(State::Match);
        self.patch(frag.out, accept);
        Ok(Matcher {
            states: StateList(self.states.into_boxed_slice()),
            start: frag.start,
            accept,
            preds: self.preds.into_values().collect::<Vec<_>>().into_boxed_slice(),
        })
    }
}

// ---------------------------------------------------------------------------
// Compiled matcher
// ---------------------------------------------------------------------------

/// One non-overlapping match: the inclusive element range it covers and
/// the matched elements themselves, moved out of the scanned input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match<T> {
    pub start: usize,
    pub end: usize,
    pub data: Vec<T>,
}

/// A compiled pattern, ready to run.  Read-only after construction: any
/// number of [`Scanner`]s may borrow it.
pub struct Matcher<T> {
    states: StateList,
    start: StateIdx,
    accept: StateIdx,
    /// Interned predicates referenced by [`Guard::Pred`].
    preds: Box<[PredFn<T>]>,
}

impl<T> fmt::Debug for Matcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("states", &self.states)
            .field("start", &self.start)
            .field("accept", &self.accept)
            .field("preds", &self.preds.len())
            .finish()
    }
}

impl<T> Matcher<T> {
    /// All non-overlapping matches, left to right, earliest start first.
    /// Zero-width matches are never reported.
    pub fn find_all(&self, seq: impl IntoIterator<Item = T>) -> Vec<Match<T>> {
        let mut scanner = self.scanner();
        let mut out = Vec::new();
        for element in seq {
            out.append(&mut scanner.push(element));
        }
        out.append(&mut scanner.end());
        out
    }

    /// The first match, or `None`.  Stops pulling from `seq` as soon as a
    /// match is definitive, so a lazy pattern terminates even on an
    /// unbounded source.
    pub fn find(&self, seq: impl IntoIterator<Item = T>) -> Option<Match<T>> {
        let mut scanner = self.scanner();
        for element in seq {
            let mut found = scanner.push(element);
            if !found.is_empty() {
                return Some(found.remove(0));
            }
        }
        scanner.end().into_iter().next()
    }

    /// Whether the pattern matches anywhere in `seq`.
    pub fn is_match(&self, seq: impl IntoIterator<Item = T>) -> bool {
        self.find(seq).is_some()
    }

    /// A fresh streaming scanner borrowing this matcher.
    pub fn scanner(&self) -> Scanner<'_, T> {
        Scanner::new(self)
    }

    /// Return the total memory footprint (in bytes) of this compiled
    /// matcher, including both inline and heap-allocated data.
    pub fn memory_size(&self) -> usize {
        let inline = std::mem::size_of::<Self>();
        let states_alloc = self.states.len() * std::mem::size_of::<State>();
        let preds_alloc = self.preds.len() * std::mem::size_of::<PredFn<T>>();
        inline + states_alloc + preds_alloc
    }

    /// Emit a Graphviz DOT representation of the NFA.  Predicates are
    /// labelled `p0`, `p1`, … in interning order; the wildcard prints as
    /// `.`, anchors as `^`/`$`, and epsilon edges as `e0` (high priority)
    /// and `e1` (low priority).
    pub fn to_dot(&self, mut buffer: impl Write) {
        let mut visited = vec![false; self.states.len()];
        writeln!(buffer, "digraph nfa {{").unwrap();
        writeln!(buffer, "\trankdir=LR;").unwrap();
        writeln!(buffer, "\t{} [shape=box];", self.start).unwrap();
        let mut stack = vec![self.start];
        while let Some(s) = stack.pop() {
            if visited[s.idx()] {
                continue;
            }
            visited[s.idx()] = true;
            writeln!(buffer, "\t// [{}] {:?}", s, self.states[s]).unwrap();
            match self.states[s] {
                State::Consume { guard, out } => {
                    stack.push(out);
                    match guard {
                        Guard::Any => {
                            writeln!(buffer, "\t{} -> {} [label=\".\"];", s, out).unwrap();
                        }
                        Guard::Pred(p) => {
                            writeln!(buffer, "\t{} -> {} [label=\"{}\"];", s, out, p)
                                .unwrap();
                        }
                    }
                }
                State::Split { out, out1 } => {
                    stack.push(out);
                    stack.push(out1);
                    writeln!(buffer, "\t{} -> {} [label=\"e0\"];", s, out).unwrap();
                    writeln!(buffer, "\t{} -> {} [label=\"e1\"];", s, out1).unwrap();
                }
                State::AssertStart { out } => {
                    stack.push(out);
                    writeln!(buffer, "\t{} -> {} [label=\"^\"];", s, out).unwrap();
                }
                State::AssertEnd { out } => {
                    stack.push(out);
                    writeln!(buffer, "\t{} -> {} [label=\"$\"];", s, out).unwrap();
                }
                State::Match => {
                    writeln!(buffer, "\t{} [peripheries=2];", s).unwrap();
                }
            }
        }
        writeln!(buffer, "}}").unwrap();
    }
}

// ---------------------------------------------------------------------------
// Scanner (NFA simulation + streaming driver)
// ---------------------------------------------------------------------------

/// A live simulation thread: the state it sits on and the input position
/// its match attempt began at.  Thread identity for deduplication is the
/// state alone; when two threads collide on a state, the earlier (higher
/// priority) one wins, which is what makes matching leftmost.
#[derive(Clone, Copy, Debug)]
struct Thread {
    state: StateIdx,
    start: usize,
}

/// The extent of a recorded-but-not-yet-emitted match.
#[derive(Clone, Copy, Debug)]
struct Span {
    start: usize,
    end: usize,
}

/// A push-based incremental matcher.
///
/// Feed elements with [`push`](Self::push) and finish with
/// [`end`](Self::end); both return every match that became definitive
/// during the call.  A match is definitive when no continuation of the
/// stream could replace it: the thread set died, or end-of-stream was
/// declared.  For lazy patterns that happens on the very push that
/// completes the match.
///
/// # Panics
///
/// [`push`](Self::push) after [`end`](Self::end), or a second `end`,
/// panics: the scanner is terminal once end-of-input has been signalled.
pub struct Scanner<'a, T> {
    matcher: &'a Matcher<T>,
    /// Per-state stamp of the step that last added the state; compared
    /// against `listid` for O(1) dedup in `add_thread`.
    lastlist: Vec<usize>,
    /// Monotonically increasing step ID.
    listid: usize,
    /// Current live threads, in decreasing priority order.
    clist: Vec<Thread>,
    /// Next step's threads, built during a step.
    nlist: Vec<Thread>,
    /// Elements retained since the earliest position any live thread or
    /// the pending match starts at.
    buffer: VecDeque<T>,
    /// Absolute position of `buffer[0]`.
    buf_base: usize,
    /// Absolute position of the next element to consume.
    pos: usize,
    /// Best accept recorded so far, not yet definitive.
    pending: Option<Span>,
    /// Set during [`end`](Self::end): lets `AssertEnd` gates pass.
    at_end: bool,
    ended: bool,
}

impl<'a, T> Scanner<'a, T> {
    fn new(matcher: &'a Matcher<T>) -> Self {
        let mut scanner = Self {
            matcher,
            lastlist: vec![usize::MAX; matcher.states.len()],
            listid: 0,
            clist: Vec::new(),
            nlist: Vec::new(),
            buffer: VecDeque::new(),
            buf_base: 0,
            pos: 0,
            pending: None,
            at_end: false,
            ended: false,
        };
        scanner.reset_at(0);
        scanner
    }

    /// Feed one element.  Returns the matches that became definitive
    /// during this push (often none, sometimes several when an emission
    /// unblocks scanning of the buffered tail).
    pub fn push(&mut self, element: T) -> Vec<Match<T>> {
        assert!(!self.ended, "Scanner::push after end()");
        self.buffer.push_back(element);
        let mut out = Vec::new();
        self.catch_up(&mut out);
        out
    }

    /// Feed a whole sequence of elements, collecting every emission.
    pub fn feed(&mut self, elements: impl IntoIterator<Item = T>) -> Vec<Match<T>> {
        let mut out = Vec::new();
        for element in elements {
            out.append(&mut self.push(element));
        }
        out
    }

    /// Signal end-of-input.  Resolves end anchors, gives greedy
    /// quantifiers their last chance, and emits everything still pending.
    /// The scanner is unusable afterwards.
    pub fn end(&mut self) -> Vec<Match<T>> {
        assert!(!self.ended, "Scanner::end called twice");
        self.ended = true;
        let mut out = Vec::new();
        loop {
            self.finalize();
            match self.pending.take() {
                Some(span) => {
                    out.push(self.extract(span));
                    self.reset_at(span.end + 1);
                    self.catch_up(&mut out);
                }
                None => break,
            }
        }
        out
    }

    // -- Simulation core ----------------------------------------------------

    /// Recursively follow epsilon transitions from `idx`, appending
    /// consuming/accepting states to `list` in priority order.  The
    /// `lastlist`/`listid` stamp guarantees each state joins at most once
    /// per step, so closures terminate even on zero-width loops and the
    /// first (highest-priority) path through a state is the one that
    /// survives.
    fn add_thread(&mut self, list: &mut Vec<Thread>, idx: StateIdx, start: usize) {
        let i = idx.idx();
        if self.lastlist[i] == self.listid {
            return;
        }
        self.lastlist[i] = self.listid;

        match self.matcher.states[idx] {
            State::Split { out, out1 } => {
                self.add_thread(list, out, start);
                self.add_thread(list, out1, start);
            }
            State::AssertStart { out } => {
                if self.pos == 0 {
                    self.add_thread(list, out, start);
                }
            }
            State::AssertEnd { out } => {
                if self.at_end {
                    self.add_thread(list, out, start);
                } else {
                    // Park: survives only if no further element arrives.
                    list.push(Thread { state: idx, start });
                }
            }
            State::Consume { .. } | State::Match => {
                list.push(Thread { state: idx, start });
            }
        }
    }

    /// Restart the simulation with a single seed at `origin`, leaving the
    /// buffer untouched.
    fn reset_at(&mut self, origin: usize) {
        self.pos = origin;
        self.at_end = false;
        self.listid += 1;
        self.clist.clear();
        let mut clist = std::mem::take(&mut self.clist);
        let start = self.matcher.start;
        self.add_thread(&mut clist, start, origin);
        self.clist = clist;
    }

    /// Advance the simulation over `buffer[i]` (the element at position
    /// `pos`): consume transitions fire in thread-priority order, then
    /// the start state is re-seeded at the next position with the lowest
    /// priority of all.  While a match is pending the re-seed is skipped:
    /// new origins would overlap it, and the replay after its emission
    /// covers them instead.
    fn step_index(&mut self, i: usize) {
        debug_assert_eq!(self.buf_base + i, self.pos);
        self.listid += 1;
        let clist = std::mem::take(&mut self.clist);
        let mut nlist = std::mem::take(&mut self.nlist);
        nlist.clear();

        for thread in &clist {
            if let State::Consume { guard, out } = self.matcher.states[thread.state] {
                let matched = match guard {
                    Guard::Any => true,
                    Guard::Pred(p) => (&*self.matcher.preds[p])(&self.buffer[i]),
                };
                if matched {
                    self.add_thread(&mut nlist, out, thread.start);
                }
            }
            // Parked AssertEnd states and zero-width Match leftovers die
            // here: another element arrived.
        }

        self.pos += 1;
        if self.pending.is_none() {
            let start = self.matcher.start;
            self.add_thread(&mut nlist, start, self.pos);
        }

        self.clist = nlist;
        self.nlist = clist;
        self.scan_accept();
        self.trim_buffer();
    }

    /// Record the highest-priority non-empty accept in `clist` (if any)
    /// as the pending match and cut every thread below it.  Threads above
    /// it stay live: any later accept they produce outranks this one and
    /// overwrites it.  Zero-width accepts are skipped, which is how empty
    /// matches are suppressed without stalling the scan.
    fn scan_accept(&mut self) {
        if self.pos == 0 {
            return;
        }
        let end = self.pos - 1;
        for i in 0..self.clist.len() {
            let thread = self.clist[i];
            if thread.state == self.matcher.accept && thread.start <= end {
                self.pending = Some(Span { start: thread.start, end });
                self.clist.truncate(i);
                break;
            }
        }
    }

    /// Drop buffered elements below the earliest position still
    /// reachable by a live thread or the pending match.
    fn trim_buffer(&mut self) {
        let mut low = match self.pending {
            Some(span) => span.start,
            None => self.pos,
        };
        for thread in &self.clist {
            low = low.min(thread.start);
        }
        while self.buf_base < low {
            self.buffer.pop_front();
            self.buf_base += 1;
        }
    }

    /// Step every buffered element the current simulation has not yet
    /// consumed, emitting whenever the thread set dies with a match
    /// pending and restarting just past each emission.
    fn catch_up(&mut self, out: &mut Vec<Match<T>>) {
        while self.pos - self.buf_base < self.buffer.len() {
            let i = self.pos - self.buf_base;
            self.step_index(i);
            if self.clist.is_empty() {
                if let Some(span) = self.pending.take() {
                    out.push(self.extract(span));
                    self.reset_at(span.end + 1);
                }
                // Dead with nothing pending: for start-anchored patterns
                // the re-seed can never pass its gate again; stepping on
                // is harmless and keeps the buffer draining.
            }
        }
    }

    /// Resolve `AssertEnd` gates against the current thread list and
    /// record a final accept if one surfaces.  Only parked assertion
    /// states are re-expanded; everything else in `clist` was fully
    /// closed over when it joined.
    fn finalize(&mut self) {
        self.at_end = true;
        self.listid += 1;
        let clist = std::mem::take(&mut self.clist);
        let mut nlist = std::mem::take(&mut self.nlist);
        nlist.clear();
        for thread in &clist {
            match self.matcher.states[thread.state] {
                State::AssertEnd { out } => self.add_thread(&mut nlist, out, thread.start),
                State::Match => nlist.push(*thread),
                _ => {}
            }
        }
        self.clist = nlist;
        self.nlist = clist;
        self.scan_accept();
    }

    /// Move the matched elements out of the buffer and produce the
    /// [`Match`].  Elements before the match start are dead (no live
    /// thread can reach back past an emitted match) and are discarded.
    fn extract(&mut self, span: Span) -> Match<T> {
        while self.buf_base < span.start {
            self.buffer.pop_front();
            self.buf_base += 1;
        }
        let take = span.end + 1 - self.buf_base;
        let data: Vec<T> = self.buffer.drain(..take).collect();
        self.buf_base = span.end + 1;
        Match { start: span.start, end: span.end, data }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
