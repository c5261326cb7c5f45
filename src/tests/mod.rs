//! Cross-component scenario tests; unit coverage lives next to each module.

mod end_to_end;
