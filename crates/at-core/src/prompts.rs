//! Prompt templates for every model conversation
//!
//! Templates are fixed text; only the record/schema payloads vary, which keeps
//! identical inputs producing identical conversations.

use crate::types::{Attempt, ExampleRecord, ExecutionError, InputRecord, LogicError, OutputSchemaError};
use serde_json::Value;
use std::fmt::Write as _;

/// Body of a passing report
pub const NO_ERRORS: &str = "No errors found, code is ready for use";

pub const SCHEMA_FROM_DESCRIPTION_SYSTEM: &str = "\
FACTS:
- You are an expert developer
- You are given a description of the output of a data transform. It can take many forms: a JSON sample, a type definition, a prose description.

RULES:
- Convert the description into a valid JSON Schema
- Only return the JSON Schema, nothing else";

pub const SCHEMA_FROM_EXAMPLES_SYSTEM: &str = "\
FACTS:
- You are an expert developer
- You are given records, each with an `input` JSON object and an `output` JSON object

RULES:
- Write a valid JSON Schema that every `output` satisfies
- Only return the JSON Schema, nothing else";

const BASE_INFORMATION: &str = "\
- You will be given the following information:
    - **OUTPUT_FORMAT**: a JSON Schema describing the expected output
    - **EXAMPLES**: `input`s with their correct `output`s
    - **POTENTIAL_INPUTS**: `input`s without `output`s that your code will also receive
    - [OPTIONAL] **EXISTING_CODE**: python code you may start from or discard";

/// System message for the code conversation
#[must_use]
pub fn code_system() -> String {
    format!(
        "### FACTS
- You are an expert python developer
- Your code will run in a python 3.11 environment
{BASE_INFORMATION}

### RULES
- Write a python function that:
    - has the signature `run_code(input: dict) -> dict`
    - accepts a dictionary called `input`
    - returns a dictionary that satisfies OUTPUT_FORMAT
- Consider every example in the conversation, not only the latest ones
- Use the python standard library only
- Reply with the function inside a ```python fenced block and nothing else"
    )
}

/// System message for the schema-revision conversation
#[must_use]
pub fn schema_revision_system() -> String {
    format!(
        "### FACTS
- You are an expert python developer
{BASE_INFORMATION}

### RULES
- Revise OUTPUT_FORMAT so that correct outputs for the given inputs satisfy it
- OUTPUT_FORMAT must remain a valid JSON Schema
- Only return the JSON Schema, nothing else"
    )
}

pub const JUDGE_SYSTEM: &str = "\
FACTS:
- You review the output of a data transform
- You will be given OUTPUT_FORMAT (a JSON Schema), an INPUT record, the EXPECTED output and the ACTUAL output

RULES:
- Decide whether ACTUAL carries the same information as EXPECTED for this INPUT
- Differences in formatting, key order or equivalent representations are acceptable
- Missing, extra or wrong information is not acceptable
- Reply with a JSON object {\"equivalent\": true|false, \"reason\": \"...\"} and nothing else";

pub const QA_SYSTEM: &str = "\
FACTS:
- You are an expert at transforming data records
- You will be given OUTPUT_FORMAT (a JSON Schema), EXAMPLES of inputs with their correct outputs and one INPUT record

RULES:
- Generate the `output` for INPUT as a JSON object that satisfies OUTPUT_FORMAT
- Follow the conventions the EXAMPLES show
- Only return the JSON object, nothing else";

#[must_use]
pub fn record_line(record: &InputRecord) -> String {
    format!("_id_:`{}` | _input_:`{}`", record.record_id(), record.to_value())
}

#[must_use]
pub fn example_line(example: &ExampleRecord) -> String {
    format!(
        "_id_:`{}` | _input_:`{}` | _output_:`{}`",
        example.input.record_id(),
        example.input.to_value(),
        example.output
    )
}

/// User message carrying the examples for schema inference
#[must_use]
pub fn examples_block(examples: &[ExampleRecord]) -> String {
    examples.iter().map(example_line).collect::<Vec<_>>().join("\n")
}

/// The task message shared by code and schema-revision conversations
#[must_use]
pub fn task_message<'a>(
    schema: &Value,
    examples: impl IntoIterator<Item = &'a ExampleRecord>,
    inputs: &[InputRecord],
    existing_code: Option<&str>,
) -> String {
    let mut out = String::new();
    let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    let _ = write!(out, "**OUTPUT_FORMAT**:\n\n```json\n{pretty}\n```\n\n**EXAMPLES**:\n\n");
    for example in examples {
        out.push_str(&example_line(example));
        out.push('\n');
    }
    out.push_str("\n**POTENTIAL_INPUTS**:\n\n");
    for record in inputs {
        out.push_str(&record_line(record));
        out.push('\n');
    }
    if let Some(code) = existing_code {
        let _ = write!(out, "\n**EXISTING_CODE**:\n```python\n{code}\n```\n");
    }
    out
}

/// Failure report fed into the next cycle
///
/// Every error appears verbatim, grouped by class.
#[must_use]
pub fn error_report(
    schema_errors: &[OutputSchemaError],
    execution_errors: &[ExecutionError],
    logic_errors: &[LogicError],
) -> String {
    if schema_errors.is_empty() && execution_errors.is_empty() && logic_errors.is_empty() {
        return NO_ERRORS.to_string();
    }
    let mut out = String::new();
    if !schema_errors.is_empty() {
        out.push_str("**Output Schema Errors**\n");
        for e in schema_errors {
            let _ = writeln!(out, "*{}* had a schema error `{}`", e.record.record_id(), e.message);
        }
    }
    if !execution_errors.is_empty() {
        out.push_str("**Execution Errors**\n");
        for e in execution_errors {
            let _ = writeln!(out, "*{}* had error `{}`", e.record.record_id(), e.message);
        }
    }
    if !logic_errors.is_empty() {
        out.push_str("**Logic Errors**\n");
        for e in logic_errors {
            let _ = writeln!(
                out,
                "*{}* had output `{}` but the correct output is `{}`",
                e.record.record_id(),
                e.actual,
                e.expected
            );
        }
    }
    out.trim_end().to_string()
}

/// Repair instruction built from a stored attempt
#[must_use]
pub fn repair_message(previous: &Attempt) -> String {
    let report = match (&previous.program, &previous.failure) {
        (None, failure) => format!(
            "The previous reply did not contain a ```python block defining `run_code`. {}",
            failure.as_deref().unwrap_or_default()
        ),
        (Some(_), _) => error_report(
            &previous.output_schema_errors,
            &previous.execution_errors,
            &previous.logic_errors,
        ),
    };
    format!(
        "**LATEST SYSTEM RESULT** (attempt {}):\n{}\n\nFix every error listed above and return the complete updated function.",
        previous.index,
        report.trim_end()
    )
}

/// User message for the equivalence judge
#[must_use]
pub fn judge_message(schema: &Value, record: &InputRecord, actual: &Value, expected: &Value) -> String {
    format!(
        "OUTPUT_FORMAT: {schema}\nINPUT: {}\nEXPECTED: {expected}\nACTUAL: {actual}",
        record.to_value()
    )
}

/// User message asking the model for its own output; INPUT is the last line
#[must_use]
pub fn qa_message<'a>(
    schema: &Value,
    examples: impl IntoIterator<Item = &'a ExampleRecord>,
    record: &InputRecord,
) -> String {
    let mut out = format!("OUTPUT_FORMAT: {schema}\nEXAMPLES:\n");
    for example in examples {
        out.push_str(&example_line(example));
        out.push('\n');
    }
    let _ = write!(out, "INPUT: {}", record.to_value());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> InputRecord {
        InputRecord::from_value(v).unwrap()
    }

    #[test]
    fn empty_report_passes() {
        assert_eq!(error_report(&[], &[], &[]), NO_ERRORS);
    }

    #[test]
    fn report_lists_every_error_under_its_header() {
        let r1 = record(json!({"phone_entry": "not a phone"}));
        let r2 = record(json!({"phone_entry": "207-307-7621"}));
        let report = error_report(
            &[OutputSchemaError {
                record: r1.clone(),
                message: "'phone_number' is a required property".into(),
            }],
            &[ExecutionError {
                record: r1.clone(),
                message: "ValueError: bad".into(),
            }],
            &[LogicError {
                record: r2.clone(),
                actual: json!({"phone_number": "2073077621"}),
                expected: json!({"phone_number": "+12073077621"}),
            }],
        );
        assert!(report.contains("**Output Schema Errors**"));
        assert!(report.contains(&format!(
            "*{}* had a schema error `'phone_number' is a required property`",
            r1.record_id()
        )));
        assert!(report.contains(&format!("*{}* had error `ValueError: bad`", r1.record_id())));
        assert!(report.contains("but the correct output is `{\"phone_number\":\"+12073077621\"}`"));
    }

    #[test]
    fn qa_message_ends_with_the_input() {
        let input = record(json!({"phone_entry": "415-854-9030"}));
        let example = ExampleRecord::new(
            record(json!({"phone_entry": "207-307-7621"})),
            json!({"phone_number": "+12073077621"}),
        );
        let message = qa_message(&json!({"type": "object"}), [&example], &input);
        assert!(message.contains(&example_line(&example)));
        assert_eq!(
            message.lines().last(),
            Some(r#"INPUT: {"phone_entry":"415-854-9030"}"#)
        );
    }

    #[test]
    fn task_message_includes_existing_code_only_when_present() {
        let schema = json!({"type": "object"});
        let with = task_message(&schema, [], &[], Some("def run_code(input):\n    return {}"));
        let without = task_message(&schema, [], &[], None);
        assert!(with.contains("**EXISTING_CODE**"));
        assert!(!without.contains("**EXISTING_CODE**"));
        assert!(without.contains("**POTENTIAL_INPUTS**"));
    }
}
