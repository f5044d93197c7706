use crate::error::Error;
use crate::pricing;

use super::{Condition, Plan, RateCard, Step, StepId};

const THEN: &str = "THEN";
const AND: &str = "AND";
const IF_SUCCESS: &str = "IF_SUCCESS";
const IF_FAILURE: &str = "IF_FAILURE";
const IF_CONTAINS: &str = "IF_CONTAINS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    Then,
    And,
}

impl Connector {
    fn as_str(self) -> &'static str {
        match self {
            Connector::Then => THEN,
            Connector::And => AND,
        }
    }
}

/// Raw text of one step plus its parsed condition.
#[derive(Debug, Default)]
struct Segment {
    text: String,
    condition: Option<Condition>,
}

impl Segment {
    fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.condition.is_none()
    }
}

#[derive(Debug)]
enum Token {
    Step(Segment),
    Connector(Connector),
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Character scanner that splits workflow text into steps and connectors.
///
/// Connectors and conditions are whole, case-sensitive words. The quoted
/// literal of an `IF_CONTAINS` is consumed verbatim, so connectors inside it
/// are not split on.
struct Tokenizer {
    chars: Vec<char>,
    pos: usize,
    tokens: Vec<Token>,
    current: Segment,
}

impl Tokenizer {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            tokens: Vec::new(),
            current: Segment::default(),
        }
    }

    /// 1-based position of the step being scanned.
    fn step_position(&self) -> usize {
        1 + self
            .tokens
            .iter()
            .filter(|t| matches!(t, Token::Step(_)))
            .count()
    }

    fn keyword_at(&self, word: &str) -> bool {
        if self.pos > 0 && is_word_char(self.chars[self.pos - 1]) {
            return false;
        }
        let len = word.chars().count();
        let end = self.pos + len;
        if end > self.chars.len() {
            return false;
        }
        if !self.chars[self.pos..end].iter().copied().eq(word.chars()) {
            return false;
        }
        self.chars.get(end).is_none_or(|&c| !is_word_char(c))
    }

    fn skip_whitespace(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn finish_segment(&mut self) {
        let segment = std::mem::take(&mut self.current);
        if !segment.is_blank() {
            self.tokens.push(Token::Step(segment));
        }
    }

    fn set_condition(&mut self, condition: Condition) -> Result<(), Error> {
        if self.current.condition.is_some() {
            return Err(Error::syntax(
                self.step_position(),
                "a step may carry only one condition",
            ));
        }
        self.current.condition = Some(condition);
        Ok(())
    }

    fn expect(&mut self, expected: char, message: &str) -> Result<(), Error> {
        self.skip_whitespace();
        if self.chars.get(self.pos) == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::syntax(self.step_position(), message))
        }
    }

    /// Parse `IF_CONTAINS("literal")` starting right after the keyword.
    fn contains_literal(&mut self) -> Result<String, Error> {
        self.expect('(', "IF_CONTAINS must be followed by (\"literal\")")?;
        self.expect('"', "IF_CONTAINS must be followed by a quoted literal")?;
        let start = self.pos;
        while self.chars.get(self.pos).is_some_and(|&c| c != '"') {
            self.pos += 1;
        }
        if self.pos >= self.chars.len() {
            return Err(Error::syntax(
                self.step_position(),
                "unterminated IF_CONTAINS literal",
            ));
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        self.pos += 1;
        self.expect(')', "expected ')' after IF_CONTAINS literal")?;
        Ok(literal)
    }

    fn run(mut self) -> Result<Vec<Token>, Error> {
        while self.pos < self.chars.len() {
            let connector = if self.keyword_at(THEN) {
                Some(Connector::Then)
            } else if self.keyword_at(AND) {
                Some(Connector::And)
            } else {
                None
            };
            if let Some(connector) = connector {
                self.finish_segment();
                self.tokens.push(Token::Connector(connector));
                self.pos += connector.as_str().len();
                continue;
            }

            if self.keyword_at(IF_SUCCESS) {
                self.set_condition(Condition::OnSuccess)?;
                self.pos += IF_SUCCESS.len();
                continue;
            }
            if self.keyword_at(IF_FAILURE) {
                self.set_condition(Condition::OnFailure)?;
                self.pos += IF_FAILURE.len();
                continue;
            }
            if self.keyword_at(IF_CONTAINS) {
                self.pos += IF_CONTAINS.len();
                let literal = self.contains_literal()?;
                self.set_condition(Condition::OnContains(literal))?;
                continue;
            }

            let c = self.chars[self.pos];
            if self.current.condition.is_some() && !c.is_whitespace() {
                return Err(Error::syntax(
                    self.step_position(),
                    "unexpected text after condition",
                ));
            }
            self.current.text.push(c);
            self.pos += 1;
        }
        self.finish_segment();
        Ok(self.tokens)
    }
}

/// Split `assignee: task` into its parts.
///
/// The prefix before the first `:` is an assignee only when it is a single
/// word; otherwise the colon belongs to the task text.
fn split_assignee(text: &str, position: usize) -> Result<(Option<&str>, &str), Error> {
    let text = text.trim();
    if let Some((head, tail)) = text.split_once(':') {
        let head = head.trim();
        if head.is_empty() {
            return Err(Error::syntax(position, "assignee name is empty"));
        }
        if !head.contains(char::is_whitespace) {
            return Ok((Some(head), tail.trim()));
        }
    }
    Ok((None, text))
}

/// Builds [`Plan`]s from workflow text.
///
/// Building is pure: the same text and default assignee always produce the
/// same plan, as long as the rate card answers the same.
pub struct PlanBuilder<'r> {
    default_assignee: String,
    rates: Option<&'r dyn RateCard>,
}

impl<'r> PlanBuilder<'r> {
    pub fn new(default_assignee: impl Into<String>) -> Self {
        Self {
            default_assignee: default_assignee.into(),
            rates: None,
        }
    }

    /// Rate lookup for `estimated_cost`. Without one the estimate is `None`.
    pub fn with_rates(mut self, rates: &'r dyn RateCard) -> Self {
        self.rates = Some(rates);
        self
    }

    pub fn build(&self, text: &str) -> Result<Plan, Error> {
        if text.trim().is_empty() {
            return Err(Error::syntax(1, "workflow text is empty"));
        }

        let tokens = Tokenizer::new(text).run()?;
        let steps = self.assemble(tokens)?;

        let batch_count = steps.last().map_or(0, |s| s.batch_index + 1);
        let mut sizes = vec![0usize; batch_count];
        for step in &steps {
            sizes[step.batch_index] += 1;
        }
        let max_parallelism = sizes.into_iter().max().unwrap_or(0);

        let estimated_cost = self.rates.and_then(|rates| {
            steps
                .iter()
                .map(|s| {
                    rates
                        .cheapest_rate(s)
                        .map(|rate| pricing::estimate_step_cost(&s.task_text, rate))
                })
                .sum::<Option<f64>>()
        });

        Ok(Plan {
            source: text.to_string(),
            default_assignee: self.default_assignee.clone(),
            steps,
            batch_count,
            max_parallelism,
            estimated_cost,
        })
    }

    /// Check connector placement and turn segments into steps.
    fn assemble(&self, tokens: Vec<Token>) -> Result<Vec<Step>, Error> {
        let mut steps: Vec<Step> = Vec::new();
        let mut previous_batch: Vec<StepId> = Vec::new();
        let mut current_batch: Vec<StepId> = Vec::new();
        let mut batch_index = 0;
        let mut pending: Option<Connector> = None;
        let last = tokens.len().saturating_sub(1);

        for (i, token) in tokens.into_iter().enumerate() {
            let position = steps.len() + 1;
            match token {
                Token::Connector(connector) => {
                    if steps.is_empty() {
                        return Err(Error::syntax(
                            position,
                            format!("workflow starts with connector {}", connector.as_str()),
                        ));
                    }
                    if let Some(prev) = pending {
                        return Err(Error::syntax(
                            position,
                            format!(
                                "consecutive connectors {} {}",
                                prev.as_str(),
                                connector.as_str()
                            ),
                        ));
                    }
                    if i == last {
                        return Err(Error::syntax(
                            position,
                            format!("workflow ends with connector {}", connector.as_str()),
                        ));
                    }
                    pending = Some(connector);
                }
                Token::Step(segment) => {
                    if pending.take() == Some(Connector::Then) {
                        previous_batch = std::mem::take(&mut current_batch);
                        batch_index += 1;
                    }
                    let (assignee, task_text) = split_assignee(&segment.text, position)?;
                    if task_text.is_empty() {
                        return Err(Error::syntax(position, "task text is empty"));
                    }
                    let id = StepId::at(position);
                    current_batch.push(id.clone());
                    steps.push(Step {
                        id,
                        assignee: assignee.unwrap_or(&self.default_assignee).to_string(),
                        task_text: task_text.to_string(),
                        depends_on: previous_batch.clone(),
                        batch_index,
                        condition: segment.condition.unwrap_or_default(),
                    });
                }
            }
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(text: &str) -> Result<Plan, Error> {
        PlanBuilder::new("worker").build(text)
    }

    fn syntax_error(text: &str) -> (usize, String) {
        match build(text) {
            Err(Error::PlanSyntax { position, message }) => (position, message),
            other => panic!("expected syntax error for {text:?}, got {other:?}"),
        }
    }

    struct FlatRate(f64);

    impl RateCard for FlatRate {
        fn cheapest_rate(&self, _step: &Step) -> Option<f64> {
            Some(self.0)
        }
    }

    struct OnlyCode;

    impl RateCard for OnlyCode {
        fn cheapest_rate(&self, step: &Step) -> Option<f64> {
            (step.assignee == "code-writer").then_some(0.001)
        }
    }

    #[test]
    fn sequential_steps_with_assignees() {
        let plan =
            build("docs-writer: document this code THEN code-writer: write a unit test").unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.batch_count, 2);
        assert_eq!(plan.max_parallelism, 1);

        let s1 = &plan.steps[0];
        assert_eq!(s1.id, StepId::at(1));
        assert_eq!(s1.assignee, "docs-writer");
        assert_eq!(s1.task_text, "document this code");
        assert_eq!(s1.batch_index, 0);
        assert!(s1.depends_on.is_empty());

        let s2 = &plan.steps[1];
        assert_eq!(s2.assignee, "code-writer");
        assert_eq!(s2.task_text, "write a unit test");
        assert_eq!(s2.batch_index, 1);
        assert_eq!(s2.depends_on, vec![StepId::at(1)]);
    }

    #[test]
    fn parallel_steps_share_batch() {
        let plan = build("task1 AND task2 AND task3").unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.batch_count, 1);
        assert_eq!(plan.max_parallelism, 3);
        for step in &plan.steps {
            assert_eq!(step.batch_index, 0);
            assert!(step.depends_on.is_empty());
            assert_eq!(step.assignee, "worker");
        }
    }

    #[test]
    fn conditional_step() {
        let plan = build("build THEN test IF_SUCCESS").unwrap();
        let s2 = &plan.steps[1];
        assert_eq!(s2.task_text, "test");
        assert_eq!(s2.condition, Condition::OnSuccess);
        assert_eq!(s2.depends_on, vec![StepId::at(1)]);
        assert_eq!(plan.steps[0].condition, Condition::None);
    }

    #[test]
    fn then_depends_on_whole_previous_batch() {
        let plan = build("a AND b THEN c AND d THEN e").unwrap();
        assert_eq!(plan.batch_count, 3);
        assert_eq!(plan.max_parallelism, 2);
        assert_eq!(plan.steps[2].depends_on, vec![StepId::at(1), StepId::at(2)]);
        assert_eq!(plan.steps[3].depends_on, vec![StepId::at(1), StepId::at(2)]);
        assert_eq!(plan.steps[4].depends_on, vec![StepId::at(3), StepId::at(4)]);
    }

    #[test]
    fn dependencies_always_in_earlier_batches() {
        let inputs = [
            "a THEN b THEN c",
            "a AND b AND c THEN d",
            "x: one THEN y: two AND z: three IF_FAILURE THEN four",
        ];
        for text in inputs {
            let plan = build(text).unwrap();
            for step in &plan.steps {
                for dep in &step.depends_on {
                    let dep = plan.step(dep).unwrap();
                    assert!(dep.batch_index < step.batch_index, "{text}");
                }
            }
            let mut indices: Vec<_> = plan.steps.iter().map(|s| s.batch_index).collect();
            indices.dedup();
            assert_eq!(indices, (0..plan.batch_count).collect::<Vec<_>>(), "{text}");
        }
    }

    #[test]
    fn building_is_deterministic() {
        let text = "a: x AND b: y THEN c IF_CONTAINS(\"ok\")";
        let first = build(text).unwrap();
        for _ in 0..5 {
            assert_eq!(build(text).unwrap(), first);
        }
    }

    #[test]
    fn contains_literal_protects_connectors() {
        let plan = build("check THEN report IF_CONTAINS(\"ready THEN go AND stop\")").unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.steps[1].condition,
            Condition::OnContains("ready THEN go AND stop".into())
        );
    }

    #[test]
    fn connectors_are_whole_words_and_case_sensitive() {
        let plan = build("ANDROID app then THENCE handy").unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps[0].task_text, "ANDROID app then THENCE handy");
    }

    #[test]
    fn colon_in_sentence_is_not_an_assignee() {
        let plan = build("explain this: why").unwrap();
        assert_eq!(plan.steps[0].assignee, "worker");
        assert_eq!(plan.steps[0].task_text, "explain this: why");
    }

    #[test]
    fn empty_input_rejected() {
        assert_eq!(syntax_error("").0, 1);
        assert_eq!(syntax_error("   \n\t").0, 1);
    }

    #[test]
    fn connector_at_start_rejected() {
        let (position, message) = syntax_error("THEN a");
        assert_eq!(position, 1);
        assert!(message.contains("starts with connector"), "{message}");
    }

    #[test]
    fn connector_at_end_rejected() {
        let (position, message) = syntax_error("a AND b AND");
        assert_eq!(position, 3);
        assert!(message.contains("ends with connector"), "{message}");
    }

    #[test]
    fn consecutive_connectors_rejected() {
        let (position, message) = syntax_error("a THEN AND b");
        assert_eq!(position, 2);
        assert!(message.contains("consecutive connectors THEN AND"), "{message}");
    }

    #[test]
    fn unterminated_literal_rejected() {
        let (position, message) = syntax_error("a THEN b IF_CONTAINS(\"oops");
        assert_eq!(position, 2);
        assert!(message.contains("unterminated"), "{message}");
    }

    #[test]
    fn contains_without_literal_rejected() {
        let (_, message) = syntax_error("a THEN b IF_CONTAINS(ok)");
        assert!(message.contains("quoted literal"), "{message}");
    }

    #[test]
    fn empty_assignee_rejected() {
        let (position, message) = syntax_error("a THEN : write docs");
        assert_eq!(position, 2);
        assert!(message.contains("assignee"), "{message}");
    }

    #[test]
    fn empty_task_text_rejected() {
        let (_, message) = syntax_error("writer:");
        assert!(message.contains("task text is empty"), "{message}");
        let (_, message) = syntax_error("a THEN IF_SUCCESS");
        assert!(message.contains("task text is empty"), "{message}");
    }

    #[test]
    fn text_after_condition_rejected() {
        let (_, message) = syntax_error("a THEN b IF_SUCCESS and more");
        assert!(message.contains("after condition"), "{message}");
    }

    #[test]
    fn double_condition_rejected() {
        let (_, message) = syntax_error("a THEN b IF_SUCCESS IF_FAILURE");
        assert!(message.contains("only one condition"), "{message}");
    }

    #[test]
    fn estimate_uses_rate_card() {
        // "document" = 8 chars → 2 input tokens → 6 total; "test" → 1 → 3
        let plan = PlanBuilder::new("worker")
            .with_rates(&FlatRate(0.01))
            .build("document THEN test")
            .unwrap();
        let cost = plan.estimated_cost.unwrap();
        assert!((cost - 0.09).abs() < 1e-12, "{cost}");
    }

    #[test]
    fn estimate_absent_without_eligible_adapter() {
        let plan = PlanBuilder::new("worker")
            .with_rates(&OnlyCode)
            .build("code-writer: a THEN docs: b")
            .unwrap();
        assert!(plan.estimated_cost.is_none());

        let plan = build("a").unwrap();
        assert!(plan.estimated_cost.is_none());
    }
}
