use crate::config::MutationSettings;
use rand::Rng;
use std::fmt;
use std::ops::Range;

/// A snippet-level transformation of a message's `Content`.
///
/// Mutations are pure: `apply` derives a new content value and never touches the
/// bytes it was given, so the seed a mutation came from stays intact unless the
/// result is promoted into a new seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Complements every byte of the snippet (`255 - b`).
    BitFlip,
    /// Removes the snippet.
    Empty,
    /// Replaces the snippet with `times` consecutive copies of itself.
    Repeat(usize),
    /// Replaces the snippet with a literal value.
    Interesting(String),
    /// Complements a random sub-range of the whole content, ignoring the snippet.
    RandomBitFlip,
}

impl Mutation {
    /// Applies the mutation to `range` of `content`.
    ///
    /// # Arguments
    /// * `content`: The canonical content; left untouched.
    /// * `range`: Half-open snippet bounds. Bounds past the end are clamped.
    /// * `rng`: Only consumed by `RandomBitFlip`.
    ///
    /// # Returns
    /// The mutated content as a fresh buffer.
    pub fn apply<R: Rng + ?Sized>(&self, content: &[u8], range: Range<usize>, rng: &mut R) -> Vec<u8> {
        let end = range.end.min(content.len());
        let start = range.start.min(end);
        let (head, rest) = content.split_at(start);
        let (snippet, tail) = rest.split_at(end - start);

        let replacement: Vec<u8> = match self {
            Mutation::BitFlip => snippet.iter().map(|b| 255 - b).collect(),
            Mutation::Empty => Vec::new(),
            Mutation::Repeat(times) => snippet.repeat(*times),
            Mutation::Interesting(literal) => literal.as_bytes().to_vec(),
            Mutation::RandomBitFlip => return random_bit_flip(content, rng),
        };

        let mut mutated = Vec::with_capacity(head.len() + replacement.len() + tail.len());
        mutated.extend_from_slice(head);
        mutated.extend_from_slice(&replacement);
        mutated.extend_from_slice(tail);
        mutated
    }

    /// Picks one havoc operator uniformly; `Repeat` and `Interesting` draw their argument too.
    pub fn random<R: Rng + ?Sized>(settings: &MutationSettings, rng: &mut R) -> Self {
        match rng.random_range(0..5) {
            0 => Mutation::BitFlip,
            1 => Mutation::Empty,
            2 => Mutation::Repeat(repeat_count(settings, rng)),
            3 => {
                let literals = &settings.interesting_literals;
                match literals.get(rng.random_range(0..literals.len().max(1))) {
                    Some(literal) => Mutation::Interesting(literal.clone()),
                    None => Mutation::Empty,
                }
            }
            _ => Mutation::RandomBitFlip,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::BitFlip => write!(f, "bit-flip"),
            Mutation::Empty => write!(f, "empty"),
            Mutation::Repeat(times) => write!(f, "repeat x{times}"),
            Mutation::Interesting(literal) => write!(f, "interesting {literal:?}"),
            Mutation::RandomBitFlip => write!(f, "random-bit-flip"),
        }
    }
}

fn repeat_count<R: Rng + ?Sized>(settings: &MutationSettings, rng: &mut R) -> usize {
    let low = settings.repeat_min.max(1);
    let high = settings.repeat_max.max(low);
    rng.random_range(low..=high)
}

fn random_bit_flip<R: Rng + ?Sized>(content: &[u8], rng: &mut R) -> Vec<u8> {
    let mut mutated = content.to_vec();
    if mutated.is_empty() {
        return mutated;
    }
    let start = rng.random_range(0..mutated.len());
    let end = rng.random_range(start..=mutated.len());
    for byte in &mut mutated[start..end] {
        *byte = 255 - *byte;
    }
    mutated
}

/// The targeted sequence run once on every snippet: bit-flip, empty, one repeat,
/// then each interesting literal in order.
pub fn targeted_plan<R: Rng + ?Sized>(settings: &MutationSettings, rng: &mut R) -> Vec<Mutation> {
    let mut plan = vec![
        Mutation::BitFlip,
        Mutation::Empty,
        Mutation::Repeat(repeat_count(settings, rng)),
    ];
    plan.extend(
        settings
            .interesting_literals
            .iter()
            .cloned()
            .map(Mutation::Interesting),
    );
    plan
}
