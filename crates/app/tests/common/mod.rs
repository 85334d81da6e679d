pub mod mock_switch;
