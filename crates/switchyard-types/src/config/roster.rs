//! Built-in worker roster.
//!
//! Used when the configuration declares no workers. Each entry carries a
//! short role description, a few reference texts for the semantic router
//! and a keyword set for the fallback path.

use super::WorkerConfig;

struct Spec {
    id: &'static str,
    description: &'static str,
    senses: &'static [&'static str],
    keywords: &'static [&'static str],
    priority: u8,
    artifacts: bool,
}

const ROSTER: &[Spec] = &[
    Spec {
        id: "echo",
        description: "Conversational interface for small talk and greetings.",
        senses: &["hallo hoe gaat het", "hello how are you", "thanks, see you later"],
        keywords: &[],
        priority: 5,
        artifacts: false,
    },
    Spec {
        id: "iolaax",
        description: "Software engineer: writes, debugs and refactors code.",
        senses: &[
            "write a python function that parses a file",
            "debug this error in my code",
            "refactor the module and fix the failing test",
        ],
        keywords: &[
            "code", "debug", "refactor", "git", "functie", "class", "programmeer", "build",
            "compile", "test", "script", "python", "javascript", "schrijf", "algoritme",
            "implementeer", "bug", "error", "fout", "module", "import",
        ],
        priority: 1,
        artifacts: true,
    },
    Spec {
        id: "cipher",
        description: "Finance and cryptography specialist.",
        senses: &[
            "bitcoin price and blockchain analysis",
            "encrypt and decrypt data with a key",
            "ethereum smart contract wallet tokens",
        ],
        keywords: &[
            "blockchain", "crypto", "encrypt", "decrypt", "smart contract", "bitcoin", "wallet",
            "token", "ethereum",
        ],
        priority: 2,
        artifacts: false,
    },
    Spec {
        id: "vita",
        description: "Health and biometrics analyst.",
        senses: &[
            "heart rate variability and sleep quality",
            "protein intake and stress levels",
        ],
        keywords: &[
            "health", "hrv", "biohack", "biodata", "biometr", "peptide", "gezondheid", "slaap",
            "eiwit", "dna", "stress",
        ],
        priority: 2,
        artifacts: false,
    },
    Spec {
        id: "navigator",
        description: "Research and web search.",
        senses: &["search the web for recent news", "research and explore a topic online"],
        keywords: &[
            "zoek op", "web search", "fetch", "scrape", "api call", "onderzoek", "explore",
            "discover", "research",
        ],
        priority: 2,
        artifacts: false,
    },
    Spec {
        id: "oracle",
        description: "Reasoning, logic and philosophy.",
        senses: &[
            "think about why this happens and reason step by step",
            "philosophy ethics and consciousness",
        ],
        keywords: &[
            "denk na", "logica", "redeneer", "droom", "bewustzijn", "evolve", "filosofie",
            "ethiek", "waarom", "hypothese",
        ],
        priority: 1,
        artifacts: false,
    },
    Spec {
        id: "spark",
        description: "Creative ideation and design.",
        senses: &["brainstorm creative ideas", "design some ascii art"],
        keywords: &["creatief", "idee", "brainstorm", "ascii", "kunst", "innovate", "design"],
        priority: 3,
        artifacts: false,
    },
    Spec {
        id: "sentinel",
        description: "Security auditing and threat analysis.",
        senses: &["security audit of the firewall", "analyse this threat"],
        keywords: &["beveilig", "security", "firewall", "audit", "threat"],
        priority: 1,
        artifacts: false,
    },
    Spec {
        id: "memex",
        description: "Knowledge retrieval and explanation.",
        senses: &[
            "what is this and how does it work",
            "recall what we know about the project",
            "explain the purpose of this component",
        ],
        keywords: &[
            "zoek kennis", "herinner", "rag", "vector", "semantic", "geheugen", "knowledge",
            "zoek in", "archief", "wat weten we over", "recall", "opzoeken", "doorzoek",
            "wat doet", "wat is", "hoe werkt", "leg uit", "vertel over", "beschrijf", "uitleg",
            "waarvoor", "wie is", "wat betekent", "doel van", "rol van", "informatie over",
            "meer over", "welke", "hoeveel", "waar zit", "waar staat", "wanneer",
        ],
        priority: 2,
        artifacts: false,
    },
    Spec {
        id: "alchemist",
        description: "Data conversion and cleaning.",
        senses: &["convert this csv to json", "transform and clean the dataset"],
        keywords: &["convert", "transform", "data_clean", "etl"],
        priority: 3,
        artifacts: false,
    },
    Spec {
        id: "void",
        description: "Cleanup of caches and stale files.",
        senses: &["clean up old files and clear the cache"],
        keywords: &["cleanup", "clean", "delete", "opruim", "cache", "garbage"],
        priority: 4,
        artifacts: false,
    },
    Spec {
        id: "chronos",
        description: "Scheduling and planning.",
        senses: &["schedule a meeting next week", "plan my agenda around the deadline"],
        keywords: &[
            "schedule", "cronjob", "timer", "dag ritme", "bio ritme", "planning", "agenda",
            "deadline", "wanneer", "herinnering",
        ],
        priority: 3,
        artifacts: false,
    },
    Spec {
        id: "pixel",
        description: "Interface, visualisation and emotional support.",
        senses: &["visualise this on the dashboard", "how do you feel about this"],
        keywords: &[
            "help", "uitleg", "interface", "praat", "emotie", "gevoel", "dashboard", "menu",
            "teken", "visualiseer", "kijk", "zie", "bekijk", "check scherm", "wat zie",
        ],
        priority: 3,
        artifacts: false,
    },
];

/// The built-in worker roster.
pub fn builtin_workers() -> Vec<WorkerConfig> {
    ROSTER
        .iter()
        .map(|s| {
            let mut w = WorkerConfig::new(s.id);
            w.description = s.description.into();
            w.senses = s.senses.iter().map(|x| (*x).to_string()).collect();
            w.keywords = s.keywords.iter().map(|x| (*x).to_string()).collect();
            w.priority = s.priority;
            w.artifacts = s.artifacts;
            if s.id == "echo" {
                w.kind = "echo".into();
            }
            w
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_ids_are_unique() {
        let workers = builtin_workers();
        let mut ids: Vec<_> = workers.iter().map(|w| w.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), workers.len());
    }

    #[test]
    fn echo_is_local() {
        let workers = builtin_workers();
        let echo = workers.iter().find(|w| w.id == "echo").unwrap();
        assert_eq!(echo.kind, "echo");
        assert!(echo.keywords.is_empty());
    }

    #[test]
    fn every_routable_worker_has_senses_and_keywords() {
        for w in builtin_workers().iter().filter(|w| w.id != "echo") {
            assert!(!w.senses.is_empty(), "{} has no senses", w.id);
            assert!(!w.keywords.is_empty(), "{} has no keywords", w.id);
        }
    }
}
