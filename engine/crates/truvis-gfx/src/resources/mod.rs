pub mod desc;
pub mod resource_state;
