//! Prompt construction for every model-driven stage.

use scholarqa_core::{PaperAggregate, QuoteSet, SectionFormat, SectionPlan};

pub fn decompose_system() -> String {
    "You turn a scientific literature question into retrieval parameters. \
     Respond with a single JSON object: rewritten_query (a fuller phrasing \
     suited to passage search), keyword_query (a short keyword form), and \
     filters with optional start_year, end_year (inclusive), venues, \
     authors, fields_of_study and limit. Leave out any filter you are not \
     confident about."
        .to_string()
}

pub fn decompose_user(query: &str) -> String {
    format!("Question: {query}")
}

pub fn extract_system() -> String {
    "You extract supporting evidence from one paper for a literature \
     question. Respond with a JSON object {\"quotes\": [...]}: each entry \
     must be an exact, verbatim substring of the provided paper text that \
     helps answer the question. Return an empty list if nothing in the \
     paper is relevant. Never paraphrase."
        .to_string()
}

pub fn extract_user(query: &str, paper: &PaperAggregate) -> String {
    let mut prompt = format!(
        "Question: {query}\n\nPaper [{}]: {}\n",
        paper.reference, paper.record.title
    );
    if let Some(year) = paper.record.year {
        prompt.push_str(&format!("Year: {year}\n"));
    }
    if let Some(venue) = &paper.record.venue {
        prompt.push_str(&format!("Venue: {venue}\n"));
    }
    prompt.push_str(&format!("\nPaper text:\n{}\n", paper.merged_text));
    prompt
}

pub fn plan_system() -> String {
    "You organize evidence quotes into a report outline. Respond with a \
     JSON object {\"sections\": [{\"name\", \"format\", \"quote_ids\"}]}. \
     format is \"synthesis\" for prose or \"list\" for an enumerated \
     comparison. Assign every quote id to exactly one section, order \
     sections so the report reads well, and give each section a distinct \
     descriptive name."
        .to_string()
}

pub fn plan_user(query: &str, quotes: &[QuoteSet]) -> String {
    let mut prompt = format!("Question: {query}\n\nEvidence quotes:\n");
    for set in quotes {
        for (handle, quote) in set.handles().zip(set.quotes.iter()) {
            prompt.push_str(&format!("[{handle}] {quote}\n"));
        }
    }
    prompt
}

pub fn synthesize_system() -> String {
    "You write one section of a scientific report answering the user's \
     question. Use only the evidence quotes provided. Cite papers inline \
     with their bracketed reference numbers, e.g. [2]. If a short one-line \
     summary is useful, start your answer with a line beginning \
     \"TLDR: \". Write plain prose, no markup."
        .to_string()
}

pub fn synthesize_user(
    query: &str,
    plan: &SectionPlan,
    quotes: &[(String, String)],
    prior_tail: &str,
) -> String {
    let format_hint = match plan.format {
        SectionFormat::Synthesis => "a cohesive prose paragraph",
        SectionFormat::List => "an enumerated comparison, one item per paper",
    };
    let mut prompt = format!(
        "Question: {query}\n\nSection: {}\nWrite {format_hint}.\n\nEvidence:\n",
        plan.name
    );
    for (id, quote) in quotes {
        prompt.push_str(&format!("[{id}] {quote}\n"));
    }
    if !prior_tail.is_empty() {
        prompt.push_str(&format!(
            "\nEarlier sections of the report (for continuity, do not repeat):\n{prior_tail}\n"
        ));
    }
    prompt
}

pub fn columns_system(max_columns: usize) -> String {
    format!(
        "You design a comparison table for a set of papers. Respond with a \
         JSON object {{\"columns\": [{{\"name\", \"description\"}}]}} with \
         at most {max_columns} columns capturing the dimensions on which \
         the papers differ."
    )
}

pub fn columns_user(query: &str, section_name: &str, papers: &[&PaperAggregate]) -> String {
    let mut prompt = format!("Question: {query}\nSection: {section_name}\n\nPapers:\n");
    for paper in papers {
        prompt.push_str(&format!("[{}] {}\n", paper.reference, paper.record.title));
    }
    prompt
}

pub fn cell_system() -> String {
    "You fill one cell of a comparison table from a paper abstract. \
     Respond with a JSON object {\"value\": ...}: a phrase of at most ten \
     words, or exactly \"N/A\" when the abstract does not say."
        .to_string()
}

pub fn cell_user(column_name: &str, column_description: &str, abstract_text: &str) -> String {
    format!(
        "Column: {column_name} ({column_description})\n\nAbstract:\n{abstract_text}"
    )
}

pub fn normalize_system() -> String {
    "You normalize one column of a comparison table. Respond with a JSON \
     object {\"values\": [...]} of the same length and order as the input: \
     harmonize units and spellings into one consistent form, keep \"N/A\" \
     as-is, and never change what a value means."
        .to_string()
}

pub fn normalize_user(column_name: &str, values: &[String]) -> String {
    let mut prompt = format!("Column: {column_name}\nValues:\n");
    for value in values {
        prompt.push_str(&format!("- {value}\n"));
    }
    prompt
}
