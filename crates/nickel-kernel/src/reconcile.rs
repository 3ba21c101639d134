use nickel_contracts::{IntentDecision, ModelReply, ToolId};
use serde_json::{Map, Value};

use crate::classifier::is_high_confidence;

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Conversational reply, nothing to execute.
    Respond { response: String },
    /// The model's tool is accepted. `unopposed` is set when the classifier
    /// had no opinion of its own.
    Execute {
        response: String,
        tool: String,
        payload: Map<String, Value>,
        unopposed: bool,
    },
    /// A confident classifier and the model disagree; nothing may run.
    Clarify {
        decision: IntentDecision,
        forced_tool: ToolId,
        llm_tool: String,
    },
}

pub fn reconcile(decision: &IntentDecision, reply: &ModelReply) -> Reconciliation {
    let forced = decision.tool.filter(|_| is_high_confidence(decision));

    let Some(action) = &reply.action else {
        return Reconciliation::Respond {
            response: reply.response.clone(),
        };
    };

    if let Some(forced_tool) = forced {
        if ToolId::parse(&action.tool) != Some(forced_tool) {
            return Reconciliation::Clarify {
                decision: decision.clone(),
                forced_tool,
                llm_tool: action.tool.clone(),
            };
        }
    }

    Reconciliation::Execute {
        response: reply.response.clone(),
        tool: action.tool.clone(),
        payload: action.payload.clone(),
        unopposed: decision.tool.is_none(),
    }
}
