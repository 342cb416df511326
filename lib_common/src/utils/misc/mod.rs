/// Process memory probing and human-readable byte formatting.
pub mod sys_info;
