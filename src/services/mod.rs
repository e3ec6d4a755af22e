pub mod access;
pub mod attendance;
pub mod grades;
pub mod homework;
pub mod slots;
