use fleetfw_domain::Generation;

// ── Compatibility table ───────────────────────────────────────────────────────

const ALL: &[Generation] = &[
    Generation::G11,
    Generation::G12,
    Generation::G13,
    Generation::G14,
    Generation::G15,
    Generation::G16,
];
const G12_PLUS: &[Generation] = &[
    Generation::G12,
    Generation::G13,
    Generation::G14,
    Generation::G15,
    Generation::G16,
];
const G14_PLUS: &[Generation] = &[Generation::G14, Generation::G15, Generation::G16];

struct CompatRule {
    component: &'static str,
    supported_generations: &'static [Generation],
    prerequisites: &'static [&'static str],
}

// Dell-specific gating. LifecycleController ships as a separate image only
// through 13G; from 14G it is folded into the iDRAC firmware. BOSS cards
// first appear on 14G and expect a current BIOS.
const RULES: &[CompatRule] = &[
    CompatRule { component: "BIOS", supported_generations: ALL, prerequisites: &[] },
    CompatRule { component: "iDRAC", supported_generations: ALL, prerequisites: &[] },
    CompatRule {
        component: "LifecycleController",
        supported_generations: &[Generation::G11, Generation::G12, Generation::G13],
        prerequisites: &[],
    },
    CompatRule { component: "NIC", supported_generations: ALL, prerequisites: &[] },
    CompatRule { component: "PERC", supported_generations: G12_PLUS, prerequisites: &[] },
    CompatRule { component: "PSU", supported_generations: G12_PLUS, prerequisites: &[] },
    CompatRule { component: "CPLD", supported_generations: G12_PLUS, prerequisites: &["iDRAC"] },
    CompatRule { component: "BOSS", supported_generations: G14_PLUS, prerequisites: &["BIOS"] },
];

fn rule_for(component: &str) -> Option<&'static CompatRule> {
    RULES.iter().find(|r| r.component.eq_ignore_ascii_case(component))
}

// ── Validation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compatibility {
    pub supported: bool,
    pub reasons: Vec<String>,
    pub prerequisites: Vec<String>,
}

/// Gate a component against the host generation and the components applied
/// (or planned) so far. Unknown components pass: the catalog is the
/// authority for anything outside the table.
pub fn validate_compatibility(
    component: &str,
    generation: Generation,
    already_applied: &[String],
) -> Compatibility {
    let Some(rule) = rule_for(component) else {
        return Compatibility {
            supported: true,
            reasons: Vec::new(),
            prerequisites: Vec::new(),
        };
    };

    let mut reasons = Vec::new();

    if generation == Generation::Unknown {
        if rule.supported_generations.len() != ALL.len() {
            reasons.push(format!(
                "host generation is unknown and {} is generation-restricted",
                rule.component
            ));
        }
    } else if !rule.supported_generations.contains(&generation) {
        reasons.push(format!("{} is not supported on {}", rule.component, generation));
    }

    for prereq in rule.prerequisites {
        let satisfied = already_applied.iter().any(|c| c.eq_ignore_ascii_case(prereq));
        if !satisfied {
            reasons.push(format!("{} requires {} to be applied first", rule.component, prereq));
        }
    }

    Compatibility {
        supported: reasons.is_empty(),
        reasons,
        prerequisites: rule.prerequisites.iter().map(|s| s.to_string()).collect(),
    }
}

// ── Ordering ──────────────────────────────────────────────────────────────────

/// Canonical apply order: BIOS first, then LifecycleController, then iDRAC,
/// then everything else lexicographically (case-insensitive).
pub fn sort_update_order(components: &[String]) -> Vec<String> {
    let rank = |c: &str| -> (u8, String) {
        let head = if c.eq_ignore_ascii_case("BIOS") {
            0
        } else if c.eq_ignore_ascii_case("LifecycleController") {
            1
        } else if c.eq_ignore_ascii_case("iDRAC") {
            2
        } else {
            3
        };
        (head, c.to_ascii_lowercase())
    };

    let mut sorted = components.to_vec();
    sorted.sort_by(|a, b| rank(a).cmp(&rank(b)));
    sorted
}
