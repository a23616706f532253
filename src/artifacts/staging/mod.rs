pub mod change_set;
