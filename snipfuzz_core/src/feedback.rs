use crate::similarity::{MAX_SIMILARITY, similarity};

/// A representative response and the score a new response needs to be counted as it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseClass {
    pub response: String,
    pub threshold: f64,
}

/// How a response relates to the classes already known for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing came back; never interesting on its own.
    Silent,
    /// Matched an existing class.
    Known(usize),
    /// Matched no class: new behaviour worth keeping.
    Novel,
}

/// Ordered set of mutually dissimilar responses observed for one message.
///
/// Entries are compared in creation order and the first one whose threshold is
/// met wins, so earlier classes take priority over later ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponsePool {
    classes: Vec<ResponseClass>,
}

impl ResponsePool {
    /// Placeholder for a message whose baseline came back empty.
    pub fn unprobeable() -> Self {
        Self {
            classes: vec![ResponseClass {
                response: String::new(),
                threshold: MAX_SIMILARITY,
            }],
        }
    }

    /// Class 0 is the first baseline; its threshold absorbs the jitter between both baselines.
    pub fn from_baseline(first: &str, second: &str) -> Self {
        Self {
            classes: vec![ResponseClass {
                response: first.to_string(),
                threshold: similarity(first, second),
            }],
        }
    }

    pub fn from_classes(classes: Vec<ResponseClass>) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &[ResponseClass] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// First class whose threshold `response` reaches.
    pub fn classify(&self, response: &str) -> Option<usize> {
        self.classes
            .iter()
            .position(|class| similarity(&class.response, response) >= class.threshold)
    }

    /// Appends `response` as a new class requiring an exact match, returning its id.
    pub fn admit(&mut self, response: &str) -> usize {
        self.classes.push(ResponseClass {
            response: response.to_string(),
            threshold: MAX_SIMILARITY,
        });
        self.classes.len() - 1
    }

    pub fn judge(&self, response: &str) -> Verdict {
        if response.trim().is_empty() {
            return Verdict::Silent;
        }
        match self.classify(response) {
            Some(class) => Verdict::Known(class),
            None => Verdict::Novel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprobeable_pool_has_single_empty_class() {
        let pool = ResponsePool::unprobeable();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.classes()[0].response, "");
        assert_eq!(pool.classes()[0].threshold, 100.0);
    }

    #[test]
    fn baseline_threshold_is_similarity_of_the_two_shots() {
        let pool = ResponsePool::from_baseline("hello", "hallo");
        assert_eq!(pool.classes()[0].threshold, 80.0);
        assert_eq!(pool.classify("hellp"), Some(0));
        assert_eq!(pool.classify("xyz"), None);
    }

    #[test]
    fn first_matching_class_wins() {
        let mut pool = ResponsePool::from_classes(vec![
            ResponseClass {
                response: "abcd".to_string(),
                threshold: 50.0,
            },
            ResponseClass {
                response: "abce".to_string(),
                threshold: 50.0,
            },
        ]);
        assert_eq!(pool.classify("abce"), Some(0));
        let id = pool.admit("zzzz");
        assert_eq!(id, 2);
        assert_eq!(pool.classify("zzzz"), Some(2));
        assert_eq!(pool.classify("zzzy"), None);
    }

    #[test]
    fn judge_distinguishes_silence_known_and_novel() {
        let pool = ResponsePool::from_baseline("OK", "OK");
        assert_eq!(pool.judge("  "), Verdict::Silent);
        assert_eq!(pool.judge("OK"), Verdict::Known(0));
        assert_eq!(pool.judge("ERR"), Verdict::Novel);
    }
}
