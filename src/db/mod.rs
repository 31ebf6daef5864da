pub mod dbroom;
