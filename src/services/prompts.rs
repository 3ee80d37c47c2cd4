//! Prompt templates and keyword-based condition detection.
//!
//! Detection drives both the `detected_conditions` column and the extra
//! guidance blocks appended to the full-pass prompt.

use crate::models::job::AnalysisMode;

/// A core-measure condition with its trigger phrases and guidance.
pub struct ConditionGuidance {
    pub tag: &'static str,
    pub triggers: &'static [&'static str],
    pub guidance: &'static str,
}

pub const CONDITIONS: &[ConditionGuidance] = &[
    ConditionGuidance {
        tag: "sepsis",
        triggers: &["sepsis", "septic shock", "severe sepsis", "sep-1"],
        guidance: "Assess against CMS SEP-1 and Surviving Sepsis Campaign guidance: 3- and 6-hour bundle checklist, cultures before antibiotics, empiric antibiotics with doses, fluid resuscitation volume per kg, vasopressor criteria, lactate trending, source control and reassessment.",
    },
    ConditionGuidance {
        tag: "heart failure",
        triggers: &["heart failure", "hf", "chf", "congestive heart failure"],
        guidance: "Plan per CMS HF measures and AHA/ACC guidance: LV function assessment, IV diuretic regimen and monitoring, GDMT optimisation (ACEi/ARB/ARNI, beta-blocker, MRA, SGLT2i), discharge instructions and follow-up.",
    },
    ConditionGuidance {
        tag: "ami",
        triggers: &["ami", "acute myocardial infarction", "mi", "stemi", "nstemi"],
        guidance: "Plan per CMS AMI measures and ACC/AHA guidance: reperfusion timing (PCI vs fibrinolysis), antiplatelet and anticoagulant dosing, adjunctive therapy, discharge medications and smoking cessation counselling.",
    },
    ConditionGuidance {
        tag: "stroke",
        triggers: &["stroke", "tia", "cva", "transient ischemic attack", "ischemic stroke"],
        guidance: "Plan per CMS STK measures and AHA/ASA guidance: thrombolysis or thrombectomy eligibility, antithrombotic timing, dysphagia screen, VTE prophylaxis, statin, blood pressure targets and education.",
    },
    ConditionGuidance {
        tag: "vte",
        triggers: &["vte", "venous thromboembolism", "dvt", "deep vein thrombosis", "pe", "pulmonary embolism"],
        guidance: "Plan per CMS VTE measures and CHEST guidance: risk stratification, agent and dose, timing, documented contraindications and discharge anticoagulation education.",
    },
    ConditionGuidance {
        tag: "pneumonia",
        triggers: &["pneumonia", "cap", "community acquired pneumonia", "hap", "hospital acquired pneumonia", "vap", "ventilator associated pneumonia"],
        guidance: "Plan per CMS PN measures and IDSA/ATS guidance: workup, empiric regimen with doses (CAP vs HAP/VAP), first-dose timing, blood cultures, oxygenation assessment, vaccination and discharge planning.",
    },
    ConditionGuidance {
        tag: "scip",
        triggers: &["scip", "surgical care improvement", "perioperative infection prevention"],
        guidance: "Perioperative checklist per CMS SCIP: prophylactic antibiotic choice, timing and discontinuation, glucose control, normothermia and hair removal.",
    },
    ConditionGuidance {
        tag: "readmission",
        triggers: &["readmission", "hrpp", "high risk discharge"],
        guidance: "High-risk discharge plan per CMS HRRP: risk stratification, medication reconciliation, scheduled follow-up, post-discharge call, home health referral and education.",
    },
    ConditionGuidance {
        tag: "dka",
        triggers: &["dka", "diabetic ketoacidosis", "hhs", "hyperosmolar hyperglycemic state"],
        guidance: "Plan per ADA guidance: diagnostic criteria, staged fluid resuscitation, insulin infusion and transition to subcutaneous insulin, potassium and phosphate replacement, precipitating causes and resolution criteria.",
    },
];

const FULL_SECTIONS: &[&str] = &[
    "Differential Diagnosis",
    "Pathophysiology Integration",
    "Diagnostic Workup",
    "Treatment and Medications",
    "Risk Stratification & Clinical Judgment",
    "Management of Chronic Conditions",
    "Infection Consideration & Antibiotics",
    "Disposition & Follow-Up",
    "Red Flags or Missed Diagnoses",
    "Clinical Guidelines Integration",
];

pub const FULL_SYSTEM_PROMPT: &str =
    "You are a medical expert that returns only formatted diagnostic analysis.";
pub const FAST_SYSTEM_PROMPT: &str = "You are a concise clinical triage assistant.";

/// Characters of the note sent on the fast pass.
pub const FAST_NOTE_LIMIT: usize = 2000;

/// Condition tags whose trigger phrases occur in the note as whole words.
pub fn detect_conditions(note: &str) -> Vec<String> {
    let normalized: String = note
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect();
    let haystack = format!(" {} ", normalized.split_whitespace().collect::<Vec<_>>().join(" "));

    CONDITIONS
        .iter()
        .filter(|c| {
            c.triggers
                .iter()
                .any(|t| haystack.contains(&format!(" {t} ")))
        })
        .map(|c| c.tag.to_string())
        .collect()
}

fn guidance_for(tag: &str) -> Option<&'static str> {
    CONDITIONS.iter().find(|c| c.tag == tag).map(|c| c.guidance)
}

/// Ten-section report prompt for the full pass.
pub fn build_full_prompt(
    note: &str,
    prompt_modifier: Option<&str>,
    detected_conditions: &[String],
    image_notes: &[String],
) -> String {
    let mut prompt = String::from(
        "You are a highly trained clinical decision support AI.\n\
         Return a detailed, structured report with EXACTLY these 10 numbered sections and \
         headings, in this order, with substantive content under each:\n\n",
    );
    for (i, section) in FULL_SECTIONS.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, section));
    }
    prompt.push_str(
        "\nEach section must contain clinically specific recommendations (drug names, doses, \
         routes, frequencies when relevant) and cite widely used guideline sources inline. \
         Do NOT output JSON.\n",
    );

    if let Some(modifier) = prompt_modifier {
        prompt.push('\n');
        prompt.push_str(modifier);
        prompt.push('\n');
    }

    prompt.push_str("\nCASE NOTE:\n");
    prompt.push_str(note);
    prompt.push('\n');

    for tag in detected_conditions {
        if let Some(guidance) = guidance_for(tag) {
            prompt.push_str(&format!(
                "\n### SPECIAL GUIDANCE: {}\n{}\n",
                tag.to_uppercase(),
                guidance
            ));
        }
    }

    prompt.push_str("\nIMAGE METADATA:\n");
    if image_notes.is_empty() {
        prompt.push_str("No images attached.\n");
    } else {
        prompt.push_str(&image_notes.join(", "));
        prompt.push('\n');
    }
    prompt
}

/// Short JSON triage prompt for the fast pass.
pub fn build_fast_prompt(note: &str) -> String {
    let truncated: String = note.chars().take(FAST_NOTE_LIMIT).collect();
    format!(
        "Return JSON with these keys only:\n\
         - differentials: top 3 (short phrases, <= 6 words each)\n\
         - initial_actions: up to 5 bullets (<= 10 words each)\n\
         - red_flags: up to 5 bullets (<= 10 words each)\n\n\
         Patient note:\n{truncated}\n"
    )
}

/// Metadata lines for images that arrive through the queue.
pub fn queued_image_notes(count: usize) -> Vec<String> {
    (1..=count)
        .map(|i| format!("image_{i}.png (queued)"))
        .collect()
}

pub fn system_prompt(mode: AnalysisMode) -> &'static str {
    match mode {
        AnalysisMode::Fast => FAST_SYSTEM_PROMPT,
        AnalysisMode::Full => FULL_SYSTEM_PROMPT,
    }
}
