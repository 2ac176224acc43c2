mod integration {
    mod id_translation;
    mod registration;
    mod offline_delivery;
    mod echo_suppression;
    mod typing;

    mod common;
}
