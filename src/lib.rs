pub mod wm;
