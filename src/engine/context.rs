//! Context rendering: composes the single text prompt an agent cycle
//! receives.
//!
//! Layout, top to bottom: track header, conventions, the car itself,
//! progress so far (newest first), supervisor guidance, recent branch
//! history, and the completion/escalation instructions.

use crate::config::TrackConfig;
use crate::models::{Car, CarProgress, Message};

pub struct ContextInput<'a> {
    pub owner: &'a str,
    pub branch_prefix: &'a str,
    pub track: &'a TrackConfig,
    pub car: &'a Car,
    /// Newest first.
    pub progress: &'a [CarProgress],
    /// Unacknowledged supervisor messages for this engine.
    pub messages: &'a [Message],
    /// Most recent commits on the car's branch, bounded.
    pub commits: &'a [String],
    /// Guidance bodies captured from the inbox since the last render.
    pub guidance: &'a [String],
    pub cycle: i32,
}

pub fn render(input: &ContextInput<'_>) -> String {
    let mut prompt = String::with_capacity(4096);
    let car = input.car;

    prompt.push_str(&format!(
        "# Track: {} ({})\nOwner: {}\nBranch namespace: {}/{}\n",
        input.track.name, input.track.language, input.owner, input.branch_prefix, input.track.name,
    ));
    if !input.track.system_prompt.is_empty() {
        prompt.push('\n');
        prompt.push_str(&input.track.system_prompt);
        prompt.push('\n');
    }

    if !input.track.conventions.is_empty() {
        prompt.push_str("\n## Conventions\n");
        let mut conventions: Vec<_> = input.track.conventions.iter().collect();
        conventions.sort();
        for (key, value) in conventions {
            prompt.push_str(&format!("- {key}: {value}\n"));
        }
    }

    prompt.push_str(&format!(
        "\n## Car {} (cycle {})\nTitle: {}\nPriority: {}\nBranch: {} (base: {})\n",
        car.id, input.cycle, car.title, car.priority, car.branch, car.base_branch,
    ));
    if !car.description.is_empty() {
        prompt.push_str(&format!("\n{}\n", car.description));
    }
    if !car.design_notes.is_empty() {
        prompt.push_str(&format!("\n### Design notes\n{}\n", car.design_notes));
    }
    if !car.acceptance.is_empty() {
        prompt.push_str(&format!("\n### Acceptance criteria\n{}\n", car.acceptance));
    }

    if !input.progress.is_empty() {
        prompt.push_str("\n## Progress so far (newest first)\n");
        for note in input.progress {
            prompt.push_str(&format!(
                "- [cycle {}] {} ({})\n",
                note.cycle, note.note, note.engine_id
            ));
            if !note.files_changed.is_empty() {
                prompt.push_str(&format!("  files: {}\n", note.files_changed));
            }
        }
    }

    if !input.messages.is_empty() {
        prompt.push_str("\n## Messages from the supervisor\n");
        for message in input.messages {
            prompt.push_str(&format!("- [{}] {}: {}\n", message.priority, message.subject, message.body));
        }
    }

    if !input.guidance.is_empty() {
        prompt.push_str("\n## Operator guidance\n");
        for line in input.guidance {
            prompt.push_str(&format!("- {line}\n"));
        }
    }

    if !input.commits.is_empty() {
        prompt.push_str(&format!("\n## Recent commits on {}\n", car.branch));
        for commit in input.commits {
            prompt.push_str(&format!("  {commit}\n"));
        }
    }

    prompt.push_str(&format!(
        "\n## When you are done\n\
         Work on branch {branch} only. Commit as you go.\n\
         - Finished and acceptance criteria met: run `railcar complete {id} --summary \"<what changed>\"`.\n\
         - Making progress but not finished: run `railcar progress {id} --note \"<where you are>\"` and exit; you will be resumed with this context.\n\
         - Stuck or blocked on something outside this car: record the blocker with `railcar progress {id} --note \"blocked: <why>\"` and exit; the supervisor will step in.\n",
        branch = car.branch,
        id = car.id,
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    use crate::models::{CarStatus, CarType, MessagePriority};

    fn track() -> TrackConfig {
        TrackConfig {
            name: "backend".into(),
            language: "rust".into(),
            conventions: HashMap::from([
                ("errors".to_string(), "thiserror at boundaries".to_string()),
                ("async".to_string(), "tokio".to_string()),
            ]),
            file_patterns: vec!["src/**/*.rs".into()],
            engine_slots: 2,
            system_prompt: "You are the backend track engine.".into(),
            test_command: None,
        }
    }

    fn car() -> Car {
        Car {
            id: "car-0a1b2".into(),
            title: "Add retry to fetcher".into(),
            description: "The fetcher gives up on the first timeout.".into(),
            car_type: CarType::Task,
            status: CarStatus::Claimed,
            priority: 1,
            track: "backend".into(),
            assignee: "eng-11111".into(),
            parent_id: None,
            branch: "yard/backend/car-0a1b2".into(),
            base_branch: "main".into(),
            design_notes: "Use exponential backoff.".into(),
            acceptance: "Three retries before surfacing the error.".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            claimed_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    fn progress(cycle: i32, note: &str) -> CarProgress {
        CarProgress {
            id: cycle as i64,
            car_id: "car-0a1b2".into(),
            engine_id: "eng-11111".into(),
            session_id: "s".into(),
            cycle,
            note: note.into(),
            files_changed: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prompt_contains_every_section_in_order() {
        let track = track();
        let car = car();
        let notes = [progress(2, "second pass"), progress(1, "first pass")];
        let messages = [Message {
            id: "msg-00001".into(),
            from_agent: "supervisor".into(),
            to_agent: "eng-11111".into(),
            subject: "merge-failed: car-0a1b2".into(),
            body: "2 tests failing".into(),
            car_id: Some("car-0a1b2".into()),
            thread_id: None,
            priority: MessagePriority::High,
            acknowledged: false,
            created_at: Utc::now(),
        }];
        let commits = ["ab12cd3 wip retry loop".to_string()];
        let guidance = ["prefer tower's retry middleware".to_string()];

        let prompt = render(&ContextInput {
            owner: "Acme",
            branch_prefix: "yard",
            track: &track,
            car: &car,
            progress: &notes,
            messages: &messages,
            commits: &commits,
            guidance: &guidance,
            cycle: 3,
        });

        let order = [
            "# Track: backend",
            "## Conventions",
            "## Car car-0a1b2 (cycle 3)",
            "### Design notes",
            "### Acceptance criteria",
            "## Progress so far",
            "## Messages from the supervisor",
            "## Operator guidance",
            "## Recent commits",
            "## When you are done",
        ];
        let mut last = 0;
        for marker in order {
            let at = prompt.find(marker).unwrap_or_else(|| panic!("missing {marker}"));
            assert!(at >= last, "{marker} out of order");
            last = at;
        }
    }

    #[test]
    fn progress_notes_render_newest_first() {
        let track = track();
        let car = car();
        let notes = [progress(2, "second pass"), progress(1, "first pass")];
        let prompt = render(&ContextInput {
            owner: "Acme",
            branch_prefix: "yard",
            track: &track,
            car: &car,
            progress: &notes,
            messages: &[],
            commits: &[],
            guidance: &[],
            cycle: 3,
        });
        assert!(prompt.find("second pass").unwrap() < prompt.find("first pass").unwrap());
    }

    #[test]
    fn completion_instructions_name_the_car() {
        let track = track();
        let car = car();
        let prompt = render(&ContextInput {
            owner: "Acme",
            branch_prefix: "yard",
            track: &track,
            car: &car,
            progress: &[],
            messages: &[],
            commits: &[],
            guidance: &[],
            cycle: 1,
        });
        assert!(prompt.contains("railcar complete car-0a1b2"));
        assert!(prompt.contains("railcar progress car-0a1b2"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let mut track = track();
        track.conventions.clear();
        track.system_prompt.clear();
        let car = car();
        let prompt = render(&ContextInput {
            owner: "Acme",
            branch_prefix: "yard",
            track: &track,
            car: &car,
            progress: &[],
            messages: &[],
            commits: &[],
            guidance: &[],
            cycle: 1,
        });
        assert!(!prompt.contains("## Conventions"));
        assert!(!prompt.contains("## Progress so far"));
        assert!(!prompt.contains("## Messages"));
        assert!(!prompt.contains("## Recent commits"));
    }
}
