use nickel_contracts::{IntentDecision, ToolId};

pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.75;
pub const AMBIGUOUS_CONFIDENCE: f64 = 0.45;

struct ActionRule {
    action: &'static str,
    tool: ToolId,
    keywords: &'static [&'static str],
    confidence: f64,
}

/// A domain keyword gates its action keywords.
struct DomainRule {
    domain: &'static str,
    keywords: &'static [&'static str],
    actions: &'static [ActionRule],
}

const CREATE: &[&str] = &["criar", "agendar", "marcar"];
const LIST: &[&str] = &["listar", "mostrar", "ver", "próxim"];

const DOMAINS: &[DomainRule] = &[
    DomainRule {
        domain: "email",
        keywords: &["email", "e-mail", "gmail", "mensagem"],
        actions: &[
            ActionRule {
                action: "send",
                tool: ToolId::EmailSend,
                keywords: &["enviar", "envie", "mande", "mandar", "dispare"],
                confidence: 0.85,
            },
            ActionRule {
                action: "draft",
                tool: ToolId::EmailDraft,
                keywords: &["rascunho", "draft", "esboço"],
                confidence: 0.8,
            },
            ActionRule {
                action: "read",
                tool: ToolId::EmailRead,
                keywords: &["ler", "abrir", "mostrar", "ver"],
                confidence: 0.75,
            },
            ActionRule {
                action: "search",
                tool: ToolId::EmailSearch,
                keywords: &["buscar", "procurar", "pesquisar", "encontr"],
                confidence: 0.8,
            },
        ],
    },
    DomainRule {
        domain: "calendar",
        keywords: &["agenda", "calendario", "calendário"],
        actions: &[
            ActionRule {
                action: "modify",
                tool: ToolId::CalendarModifyEvent,
                keywords: &["alterar", "mudar", "remarcar", "editar"],
                confidence: 0.85,
            },
            ActionRule {
                action: "create",
                tool: ToolId::CalendarCreateEvent,
                keywords: CREATE,
                confidence: 0.85,
            },
            ActionRule {
                action: "list",
                tool: ToolId::CalendarListEvents,
                keywords: LIST,
                confidence: 0.8,
            },
        ],
    },
    DomainRule {
        domain: "notes",
        keywords: &["nota", "notas", "anotação", "anotacoes"],
        actions: &[ActionRule {
            action: "create",
            tool: ToolId::NotesCreate,
            keywords: CREATE,
            confidence: 0.85,
        }],
    },
    DomainRule {
        domain: "tasks",
        keywords: &["tarefa", "tarefas", "to-do", "todo"],
        actions: &[
            ActionRule {
                action: "create",
                tool: ToolId::TasksCreate,
                keywords: CREATE,
                confidence: 0.85,
            },
            ActionRule {
                action: "list",
                tool: ToolId::TasksList,
                keywords: LIST,
                confidence: 0.8,
            },
        ],
    },
    DomainRule {
        domain: "spotify",
        keywords: &["spotify", "música", "musica", "som"],
        actions: &[
            ActionRule {
                action: "pause",
                tool: ToolId::SpotifyPause,
                keywords: &["pausar", "pause", "parar"],
                confidence: 0.85,
            },
            ActionRule {
                action: "skip",
                tool: ToolId::SpotifySkip,
                keywords: &["pular", "próxima", "proxima", "skip"],
                confidence: 0.85,
            },
            ActionRule {
                action: "play",
                tool: ToolId::SpotifyPlay,
                keywords: &["tocar", "play", "reproduzir", "iniciar"],
                confidence: 0.8,
            },
        ],
    },
];

pub fn classify(message: &str) -> IntentDecision {
    let normalized = message.to_lowercase();
    let mut matched: Vec<(&DomainRule, &ActionRule)> = Vec::new();
    for domain in DOMAINS {
        if !mentions(&normalized, domain.keywords) {
            continue;
        }
        for action in domain.actions {
            if mentions(&normalized, action.keywords) {
                matched.push((domain, action));
            }
        }
    }

    match matched.as_slice() {
        [] => IntentDecision {
            tool: None,
            reason: "no_tool_match".to_string(),
            confidence: 0.0,
        },
        [(domain, action)] => IntentDecision {
            tool: Some(action.tool),
            reason: format!("{}_{}_keyword", domain.domain, action.action),
            confidence: action.confidence,
        },
        many => {
            let candidates: Vec<&str> = many.iter().map(|(_, a)| a.tool.as_str()).collect();
            IntentDecision {
                tool: None,
                reason: format!("ambiguous_tool_match:{}", candidates.join(",")),
                confidence: AMBIGUOUS_CONFIDENCE,
            }
        }
    }
}

pub fn is_high_confidence(decision: &IntentDecision) -> bool {
    decision.confidence >= HIGH_CONFIDENCE_THRESHOLD
}

/// A keyword counts only where a word starts, so stems still match their
/// inflections but never the middle of another word.
fn mentions(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| {
        text.match_indices(keyword).any(|(idx, _)| {
            text[..idx]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_alphanumeric())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_email_is_high_confidence() {
        let decision = classify("enviar email para o cliente");
        assert_eq!(decision.tool, Some(ToolId::EmailSend));
        assert_eq!(decision.reason, "email_send_keyword");
        assert_eq!(decision.confidence, 0.85);
        assert!(is_high_confidence(&decision));
    }

    #[test]
    fn single_matches_carry_their_fixed_weight() {
        for (message, tool, confidence) in [
            ("pausar a música", ToolId::SpotifyPause, 0.85),
            ("criar uma tarefa para amanhã", ToolId::TasksCreate, 0.85),
            ("listar minhas tarefas", ToolId::TasksList, 0.8),
            ("agendar reunião na agenda", ToolId::CalendarCreateEvent, 0.85),
            ("ALTERAR compromisso da Agenda", ToolId::CalendarModifyEvent, 0.85),
            ("fazer um rascunho de e-mail", ToolId::EmailDraft, 0.8),
            ("pesquisar no gmail as faturas", ToolId::EmailSearch, 0.8),
            ("tocar spotify", ToolId::SpotifyPlay, 0.8),
        ] {
            let decision = classify(message);
            assert_eq!(decision.tool, Some(tool), "message: {message}");
            assert_eq!(decision.confidence, confidence, "message: {message}");
        }
    }

    #[test]
    fn ambiguous_intent_is_low_confidence() {
        let decision = classify("quero ver agenda e mandar email");
        assert_eq!(decision.tool, None);
        assert!(decision.reason.starts_with("ambiguous_tool_match:"));
        assert!(decision.reason.contains("email.send"));
        assert!(decision.reason.contains("email.read"));
        assert!(decision.reason.contains("calendar.list_events"));
        assert_eq!(decision.confidence, AMBIGUOUS_CONFIDENCE);
        assert!(!is_high_confidence(&decision));
    }

    #[test]
    fn non_tool_phrase_returns_no_tool() {
        let decision = classify("como você está hoje?");
        assert_eq!(decision.tool, None);
        assert_eq!(decision.reason, "no_tool_match");
        assert_eq!(decision.confidence, 0.0);
        assert!(!is_high_confidence(&decision));
    }

    #[test]
    fn domain_without_action_is_no_match() {
        let decision = classify("o que acha do spotify?");
        assert_eq!(decision.tool, None);
        assert_eq!(decision.reason, "no_tool_match");
    }

    #[test]
    fn keywords_do_not_fire_inside_other_words() {
        let decision = classify("enviar email para o servidor");
        assert_eq!(decision.tool, Some(ToolId::EmailSend));
        assert_eq!(decision.reason, "email_send_keyword");

        let decision = classify("mostrar as próximas tarefas");
        assert_eq!(decision.tool, Some(ToolId::TasksList));

        assert_eq!(classify("a agenda do conversor").tool, None);
    }

    #[test]
    fn classification_is_deterministic() {
        let first = classify("quero ver agenda e mandar email");
        for _ in 0..10 {
            assert_eq!(classify("quero ver agenda e mandar email"), first);
        }
    }
}
