//! Sample clinical notes for E2E testing

/// A note to submit, with the condition tags the keyword detector should find.
#[derive(Debug, Clone)]
pub struct ClinicalNoteFixture {
    pub note: &'static str,
    pub specialty: &'static str,
    pub expected_patient: &'static str,
    pub expected_conditions: &'static [&'static str],
    pub description: &'static str,
}

pub const NOTE_FIXTURES: &[ClinicalNoteFixture] = &[
    ClinicalNoteFixture {
        note: "Maria Lopez, 67F, fever 39.2, HR 118, BP 84/50, lactate 4.1, suspected urosepsis progressing to septic shock.",
        specialty: "icu",
        expected_patient: "Maria Lopez",
        expected_conditions: &["sepsis"],
        description: "Septic shock with hypotension",
    },
    ClinicalNoteFixture {
        note: "James Carter, 58M, crushing chest pain radiating to left arm, ST elevation in II, III, aVF. STEMI alert called.",
        specialty: "cardiology",
        expected_patient: "James Carter",
        expected_conditions: &["ami"],
        description: "Inferior STEMI",
    },
    ClinicalNoteFixture {
        note: "Aisha Khan, 24F, type 1 diabetic, vomiting, glucose 512, pH 7.12, anion gap 24, consistent with DKA.",
        specialty: "endocrinology",
        expected_patient: "Aisha Khan",
        expected_conditions: &["dka"],
        description: "Diabetic ketoacidosis",
    },
    ClinicalNoteFixture {
        note: "Robert Chen, 81M, CHF exacerbation with bilateral crackles, also right lower lobe pneumonia on CXR.",
        specialty: "general",
        expected_patient: "Robert Chen",
        expected_conditions: &["heart failure", "pneumonia"],
        description: "Heart failure with community pneumonia",
    },
    ClinicalNoteFixture {
        note: "Follow-up visit for routine hypertension check, BP 132/84, no complaints",
        specialty: "general",
        expected_patient: "Unknown",
        expected_conditions: &[],
        description: "No comma, no core-measure conditions",
    },
];
