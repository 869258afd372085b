pub mod passphrase;
