//! Tool-result deduplication
//!
//! Some providers reject a conversation in which the same `tool_use_id`
//! is answered twice. Before an Anthropic-format body goes upstream,
//! duplicated results are collapsed to their last occurrence and any
//! message emptied by the collapse is dropped.

use std::collections::HashMap;

use crate::protocol::anthropic::{ContentBlock, MessageContent, MessagesRequest};

/// Keep only the last `tool_result` per `tool_use_id`
///
/// Idempotent, and a no-op on requests without duplicates.
pub fn dedup_tool_results(req: &mut MessagesRequest) {
    let mut last: HashMap<String, (usize, usize)> = HashMap::new();

    for (msg_idx, msg) in req.messages.iter().enumerate() {
        if let MessageContent::Blocks(blocks) = &msg.content {
            for (block_idx, block) in blocks.iter().enumerate() {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    last.insert(tool_use_id.clone(), (msg_idx, block_idx));
                }
            }
        }
    }

    for (msg_idx, msg) in req.messages.iter_mut().enumerate() {
        if let MessageContent::Blocks(blocks) = &mut msg.content {
            let mut block_idx = 0;
            blocks.retain(|block| {
                let keep = match block {
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        last.get(tool_use_id) == Some(&(msg_idx, block_idx))
                    }
                    _ => true,
                };
                block_idx += 1;
                keep
            });
        }
    }

    req.messages
        .retain(|msg| !matches!(&msg.content, MessageContent::Blocks(blocks) if blocks.is_empty()));
}
