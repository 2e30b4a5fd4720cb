mod lowered;
mod tree;
